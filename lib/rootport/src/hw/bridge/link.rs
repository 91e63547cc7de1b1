// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use super::bits;
use crate::hw::pci::DevFn;
use crate::mmio::RegisterBlock;

use thiserror::Error;

/// Reasons a configuration-space access is refused.
#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum AccessError {
    /// Downstream bus accessed while the link is not in L0
    #[error("link is down, bus {bus} is unreachable")]
    LinkDown { bus: u8 },

    /// The root bus carries only the root port itself, at function 0
    #[error("no function {devfn} on root bus {bus}")]
    InvalidAccess { bus: u8, devfn: DevFn },

    #[error("config offset {0:#x} is beyond the 4KiB ECAM region")]
    OffsetOutOfRange(u16),

    /// The bus number is not covered by the configuration window
    #[error("bus {bus} lies outside the configuration window")]
    OutsideWindow { bus: u8 },
}

/// Decides whether a configuration-space access may be issued.
///
/// Reads against a fabric without a trained link hang or return garbage on
/// this bridge rather than completing with all-ones, so every downstream
/// access is gated on the LTSSM reporting L0.
pub struct LinkStateGate {
    ctrl: Arc<dyn RegisterBlock>,
}

impl LinkStateGate {
    pub fn new(ctrl: Arc<dyn RegisterBlock>) -> Self {
        Self { ctrl }
    }

    /// Current raw LTSSM state.
    pub fn ltssm_state(&self) -> u32 {
        self.ctrl.read32(bits::CTRL_LTSSM_STATE) & bits::LTSSM_STATE_MASK
    }

    pub fn is_link_up(&self) -> bool {
        self.ltssm_state() == bits::LTSSM_L0
    }

    pub fn check_access(
        &self,
        bus: u8,
        devfn: DevFn,
        root_bus: u8,
    ) -> Result<(), AccessError> {
        if bus == root_bus {
            // Only the root port itself lives on the root bus
            if devfn == DevFn::ZERO {
                Ok(())
            } else {
                Err(AccessError::InvalidAccess { bus, devfn })
            }
        } else if self.is_link_up() {
            Ok(())
        } else {
            Err(AccessError::LinkDown { bus })
        }
    }

    pub fn validate_access(&self, bus: u8, devfn: DevFn, root_bus: u8) -> bool {
        self.check_access(bus, devfn, root_bus).is_ok()
    }
}
