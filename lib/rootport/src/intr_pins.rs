// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logical interrupt identities and the sink they are delivered to.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::num::NonZeroU32;

/// The two interrupt domains multiplexed onto the bridge's physical line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum IrqDomain {
    /// Legacy INTx lines A-D.
    Legacy,
    /// Message-signaled vectors.
    Msi,
}

impl Display for IrqDomain {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            IrqDomain::Legacy => write!(f, "intx"),
            IrqDomain::Msi => write!(f, "msi"),
        }
    }
}

/// Opaque handle for a mapped interrupt, unique within a bridge.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirqId(NonZeroU32);

impl VirqId {
    pub(crate) const fn from_raw(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }
    pub const fn get(&self) -> u32 {
        self.0.get()
    }
}

impl Display for VirqId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "virq{}", self.0)
    }
}

/// A hardware interrupt source bound to a logical identity.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LogicalInterrupt {
    pub domain: IrqDomain,
    /// INTx line (0-3) or MSI vector number.
    pub hw_index: u32,
    pub virq: VirqId,
}

impl Display for LogicalInterrupt {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{} ({})", self.domain, self.hw_index, self.virq)
    }
}

/// Consumer of demultiplexed interrupts.
///
/// `fire` is called from the dispatch path: implementations must not block
/// and must not call back into the router which is dispatching.
pub trait IrqSink: Send + Sync + 'static {
    fn fire(&self, irq: LogicalInterrupt);
}

/// Outcome reported to the infrastructure which owns the physical line.
///
/// The bridge acknowledges every assertion at the hardware level, even when
/// some of the pending sources had no mapping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqReturn {
    Handled,
}
