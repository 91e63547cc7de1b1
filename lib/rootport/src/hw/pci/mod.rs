// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::Result as FmtResult;
use std::fmt::{Display, Formatter};
use std::io::{Error, ErrorKind};
use std::str::FromStr;

use strum::FromRepr;

pub mod bits;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct BusNum(u8);
impl BusNum {
    pub const fn new(n: u8) -> Self {
        Self(n)
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct DevNum(u8);
impl DevNum {
    /// Attempts to make a new PCI [DevNum]
    ///
    /// Returns [`Option::None`] if `n` is outside the range for a valid PCI
    /// device.
    pub const fn new(n: u8) -> Option<Self> {
        if n <= bits::MASK_DEV {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct FuncNum(u8);
impl FuncNum {
    /// Attempts to make a new PCI [FuncNum]
    ///
    /// Returns [`Option::None`] if `n` is outside the range for a valid PCI
    /// function.
    pub const fn new(n: u8) -> Option<Self> {
        if n <= bits::MASK_FUNC {
            Some(Self(n))
        } else {
            None
        }
    }
    pub const fn get(&self) -> u8 {
        self.0
    }
}

/// A device/function located on a specific PCI bus.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct BusLocation {
    pub dev: DevNum,
    pub func: FuncNum,
}

impl BusLocation {
    /// Attempts to make a new PCI [BusLocation]
    ///
    /// Returns [`Option::None`] if the `dev` or `func` are outside their
    /// respective valid ranges.
    pub const fn new(dev: u8, func: u8) -> Option<Self> {
        let dnum = DevNum::new(dev);
        let fnum = FuncNum::new(func);
        match (dnum, fnum) {
            (Some(d), Some(f)) => Some(Self { dev: d, func: f }),
            _ => None,
        }
    }

    pub const fn devfn(&self) -> DevFn {
        DevFn(self.dev.0 << 3 | self.func.0)
    }
}

/// Device and function packed into the single byte used by ECAM addressing:
/// device in bits 7:3, function in bits 2:0.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd, Hash)]
pub struct DevFn(u8);

impl DevFn {
    /// The first function of the first device on a bus.
    pub const ZERO: DevFn = DevFn(0);

    pub const fn new(dev: u8, func: u8) -> Option<Self> {
        match BusLocation::new(dev, func) {
            Some(loc) => Some(loc.devfn()),
            None => None,
        }
    }
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }
    pub const fn raw(&self) -> u8 {
        self.0
    }
    pub const fn location(&self) -> BusLocation {
        BusLocation { dev: DevNum(self.0 >> 3), func: FuncNum(self.0 & 0x7) }
    }
}

impl Display for DevFn {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let loc = self.location();
        write!(f, "{:02x}.{}", loc.dev.0, loc.func.0)
    }
}

/// Bus, Device, Function.
///
/// Acts as an address for PCI and PCIe device functionality.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct Bdf {
    pub bus: BusNum,
    pub location: BusLocation,
}

impl FromStr for Bdf {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Vec::with_capacity(3);
        for f in s.split('.') {
            let num = usize::from_str(f).map_err(|e| {
                Error::new(ErrorKind::InvalidInput, e.to_string())
            })?;
            if num > u8::MAX as usize {
                return Err(Error::new(
                    ErrorKind::InvalidInput,
                    format!("Value too large: {}", num),
                ));
            }
            fields.push(num as u8);
        }

        if fields.len() != 3 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Wrong number of fields for BDF",
            ));
        }

        Bdf::new(fields[0], fields[1], fields[2]).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidInput,
                "Failed to parse as BDF".to_string(),
            )
        })
    }
}

impl Bdf {
    /// Attempts to make a new PCI [Bdf].
    ///
    /// Returns [`Option::None`] if the values would not fit within a BDF.
    pub const fn new(bus: u8, dev: u8, func: u8) -> Option<Self> {
        if let Some(location) = BusLocation::new(dev, func) {
            Some(Self { bus: BusNum::new(bus), location })
        } else {
            None
        }
    }

    pub const fn from_devfn(bus: u8, devfn: DevFn) -> Self {
        Self { bus: BusNum::new(bus), location: devfn.location() }
    }

    pub const fn devfn(&self) -> DevFn {
        self.location.devfn()
    }
}
impl Display for Bdf {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "{}.{}.{}",
            self.bus.0, self.location.dev.0, self.location.func.0
        )
    }
}

/// Legacy interrupt pin, numbered as in the Interrupt Pin config register.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, FromRepr)]
pub enum INTxPinID {
    IntA = 1,
    IntB = 2,
    IntC = 3,
    IntD = 4,
}

/// Number of legacy INTx lines.
pub const INTX_COUNT: usize = 4;

impl INTxPinID {
    /// Zero-based line number as used by the bridge's status registers.
    pub const fn line(self) -> u32 {
        self as u32 - 1
    }
    pub fn from_line(line: u32) -> Option<Self> {
        let pin = line.checked_add(1)?;
        u8::try_from(pin).ok().and_then(Self::from_repr)
    }
    pub fn iter() -> impl Iterator<Item = INTxPinID> {
        (1..=INTX_COUNT as u8).filter_map(Self::from_repr)
    }
}

/// Offset of a function's configuration register within an ECAM region.
pub const fn ecam_offset(bus: u8, devfn: DevFn, offset: u16) -> usize {
    ((bus as usize) << bits::ECAM_BUS_SHIFT
        | (devfn.0 as usize) << bits::ECAM_DEVFN_SHIFT)
        + offset as usize
}
