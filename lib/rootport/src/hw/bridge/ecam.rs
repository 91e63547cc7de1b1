// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::link::{AccessError, LinkStateGate};
use crate::common::AddressRange;
use crate::hw::pci::{self, bits::MASK_ECAM_CFG_OFFSET, DevFn};

/// Turns (bus, devfn, offset) into an address in the configuration window.
///
/// The window is the local side of translation slot 0. Buses are addressed
/// by absolute number, so the window must be large enough to cover every
/// bus the enumerator walks.
pub struct ConfigSpaceResolver {
    window: AddressRange,
    root_bus: u8,
    link: LinkStateGate,
}

impl ConfigSpaceResolver {
    pub fn new(
        window: AddressRange,
        root_bus: u8,
        link: LinkStateGate,
    ) -> Self {
        Self { window, root_bus, link }
    }

    pub fn window(&self) -> AddressRange {
        self.window
    }
    pub fn root_bus(&self) -> u8 {
        self.root_bus
    }
    pub fn link(&self) -> &LinkStateGate {
        &self.link
    }

    /// Offset of a register relative to the start of the window, without
    /// any access checks.
    fn window_offset(bus: u8, devfn: DevFn, offset: u16) -> u64 {
        pci::ecam_offset(bus, devfn, offset) as u64
    }

    pub fn try_resolve(
        &self,
        bus: u8,
        devfn: DevFn,
        offset: u16,
    ) -> Result<u64, AccessError> {
        if offset as usize > MASK_ECAM_CFG_OFFSET {
            return Err(AccessError::OffsetOutOfRange(offset));
        }
        self.link.check_access(bus, devfn, self.root_bus)?;

        let rel = Self::window_offset(bus, devfn, offset);
        if rel >= self.window.size {
            return Err(AccessError::OutsideWindow { bus });
        }
        Ok(self.window.base + rel)
    }

    /// Resolve an access, yielding `None` when the enumerator should treat
    /// the function as absent.
    pub fn resolve(&self, bus: u8, devfn: DevFn, offset: u16) -> Option<u64> {
        self.try_resolve(bus, devfn, offset).ok()
    }
}
