// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-bridge controller for an AXI-attached PCI Express root port.
//!
//! The crate owns the pieces of a root-port driver that sit between a
//! generic bus enumerator and the bridge silicon: the address translation
//! table, the configuration-space access gate and ECAM resolver, and the
//! demultiplexer that turns the bridge's single interrupt line into legacy
//! INTx and MSI logical interrupts.

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub mod common;
pub mod hw;
pub mod intr_pins;
pub mod mmio;
pub mod util;

pub use hw::bridge::{BridgeError, BridgePort, BridgeRegs, PortResources};

pub fn version() -> &'static str {
    lazy_static::lazy_static! {
        static ref VERSION: String = {
            let git = option_env!("VERGEN_GIT_BRANCH")
                .and_then(|branch| {
                    Some((branch, option_env!("VERGEN_GIT_SHA")?))
                });

            let mut version = format!("v{}", env!("CARGO_PKG_VERSION"));
            match git {
                Some((branch, sha)) => {
                    version.push_str(&format!(" ({sha}) {branch}"));
                }
                None => version.push_str(" <unknown git commit>"),
            }
            version
        };
    };
    &VERSION
}
