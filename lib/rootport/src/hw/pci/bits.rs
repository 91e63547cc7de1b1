// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PCI config registers.

pub const LEN_CFG: usize = 0x100;
pub const LEN_CFG_ECAM: usize = 0x1000;

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RegStatus: u16 {
        const CAP_LIST = 1 << 4;
    }
}

bitflags! {
    /// MSI capability Message Control register.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MsiCtrl: u16 {
        const ENABLE = 1 << 0;
        const ADDR_64 = 1 << 7;
    }
}

pub const OFFSET_VENDOR_ID: usize = 0x00;
pub const OFFSET_COMMAND: usize = 0x04;
pub const OFFSET_STATUS: usize = 0x06;
pub const OFFSET_CLASS_REV: usize = 0x08;
pub const OFFSET_HEADER_TYPE: usize = 0x0e;
/// Primary, secondary and subordinate bus numbers plus latency timer.
pub const OFFSET_PRIMARY_BUS: usize = 0x18;
pub const OFFSET_CAP_PTR: usize = 0x34;

// Offsets within an MSI capability
pub const MSI_OFFSET_CTRL: usize = 0x02;
pub const MSI_OFFSET_ADDR_LO: usize = 0x04;
pub const MSI_OFFSET_ADDR_HI: usize = 0x08;
pub const MSI_OFFSET_DATA_32: usize = 0x08;
pub const MSI_OFFSET_DATA_64: usize = 0x0c;

pub const CAP_ID_MSI: u8 = 0x05;

pub const CLASS_BRIDGE: u8 = 6;
pub const SUBCLASS_BRIDGE_PCI: u8 = 4;

/// Class code (class and subclass) of a PCI-PCI bridge.
pub const CLASS_CODE_BRIDGE_PCI: u16 =
    (CLASS_BRIDGE as u16) << 8 | SUBCLASS_BRIDGE_PCI as u16;

pub const HEADER_TYPE_BRIDGE: u8 = 0b1;

pub(super) const MASK_FUNC: u8 = 0x07;
pub(super) const MASK_DEV: u8 = 0x1f;

/// Bit position of the bus number within an ECAM offset.
pub const ECAM_BUS_SHIFT: u32 = 20;
/// Bit position of the device/function number within an ECAM offset.
pub const ECAM_DEVFN_SHIFT: u32 = 12;

/// Bitwise AND'ing an ECAM MMIO access address with this mask produces an
/// offset in bytes at which to access the target BDF's configuration region.
pub const MASK_ECAM_CFG_OFFSET: usize = 0xfff;

/// Value read back from configuration space when no function responds.
pub const VENDOR_ID_NONE: u16 = 0xffff;
