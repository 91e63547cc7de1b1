// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AXI to PCI Express root port bridge.

use std::sync::Arc;

use crate::common::{AddressRange, Width};
use crate::hw::pci::{self, bits as pci_bits, Bdf, DevFn};
use crate::intr_pins::{IrqReturn, IrqSink, LogicalInterrupt};
use crate::mmio::RegisterBlock;

use thiserror::Error;

pub mod atr;
pub mod bits;
mod ecam;
mod init;
pub mod intr;
mod link;
pub mod msi;

pub use atr::{
    AddressTranslationTable, AtrError, RegionKind, TranslationRegion,
};
pub use ecam::ConfigSpaceResolver;
pub use init::BridgeInitializer;
pub use intr::{
    CfgMsiTarget, InterruptRouter, IrqError, MsiMessage, MsiTarget,
};
pub use link::{AccessError, LinkStateGate};
pub use msi::{MsiError, MsiVectorAllocator, MsiVectorId};

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BridgeError {
    #[error("address translation: {0}")]
    Atr(#[from] AtrError),

    /// More memory ranges than translation slots
    #[error("no free translation slot for range {range}")]
    NoFreeSlot { range: AddressRange },

    #[error("no configuration window was supplied")]
    MissingConfigWindow,

    #[error("interrupt setup: {0}")]
    Irq(#[from] IrqError),

    #[error("{0} has no MSI capability")]
    NoMsiCapability(Bdf),

    /// The root port's own header is not reachable through the ECAM block
    #[error("root bus {bus} lies outside the configuration window")]
    RootBusOutsideWindow { bus: u8 },
}

/// Type of a host bridge window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RangeKind {
    Io,
    Mem,
    PrefetchMem,
}

impl RangeKind {
    pub const fn is_mem(self) -> bool {
        matches!(self, RangeKind::Mem | RangeKind::PrefetchMem)
    }
}

/// A window through which the CPU reaches PCI address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PciRange {
    pub kind: RangeKind,
    pub cpu_addr: u64,
    pub pci_addr: u64,
    pub size: u64,
}

impl PciRange {
    pub fn cpu_range(&self) -> AddressRange {
        AddressRange::new(self.cpu_addr, self.size)
    }
}

/// Everything the bridge needs to know about its surroundings, already
/// resolved from firmware.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortResources {
    pub name: String,
    pub root_bus: u8,
    /// Local window of the ECAM region
    pub config_window: AddressRange,
    pub ranges: Vec<PciRange>,
    /// Translation slots the bridge implements
    pub atr_slots: usize,
    pub msi: bool,
}

/// The three register blocks of a root port.
#[derive(Clone)]
pub struct BridgeRegs {
    /// ECAM region, also holding the root port's own config header
    pub ecam: Arc<dyn RegisterBlock>,
    /// Bridge APB: interrupt status, translation tables, IDs
    pub bridge: Arc<dyn RegisterBlock>,
    /// Controller APB: error interrupts and link state
    pub ctrl: Arc<dyn RegisterBlock>,
}

/// One attached root port.
pub struct BridgePort {
    name: String,
    root_bus: u8,
    regs: BridgeRegs,
    atr: AddressTranslationTable,
    resolver: ConfigSpaceResolver,
    router: InterruptRouter,
    log: slog::Logger,
}

impl BridgePort {
    /// Bring up the bridge described by `res`.
    pub fn attach(
        res: PortResources,
        regs: BridgeRegs,
        sink: Arc<dyn IrqSink>,
        log: &slog::Logger,
    ) -> Result<Self, BridgeError> {
        let log = log.new(slog::o!("port" => res.name.clone()));

        let window_size = atr::enclosing_window_size(res.config_window.size)
            .ok_or(BridgeError::MissingConfigWindow)?;
        let root_end = pci::ecam_offset(res.root_bus, DevFn::ZERO, 0)
            + pci_bits::LEN_CFG_ECAM;
        if root_end as u64 > window_size || root_end > regs.ecam.len() {
            return Err(BridgeError::RootBusOutsideWindow { bus: res.root_bus });
        }

        let mut atr =
            AddressTranslationTable::new(regs.bridge.clone(), res.atr_slots)?;
        let router = InterruptRouter::new(
            regs.bridge.clone(),
            regs.ecam.clone(),
            res.root_bus,
            sink,
            log.new(slog::o!("component" => "intr")),
        );
        BridgeInitializer::new(&regs, &res, &log).run(&mut atr, &router)?;

        let window = atr
            .config_space_window()
            .ok_or(BridgeError::MissingConfigWindow)?;
        let resolver = ConfigSpaceResolver::new(
            window,
            res.root_bus,
            LinkStateGate::new(regs.ctrl.clone()),
        );

        slog::info!(log, "root port attached";
            "root_bus" => res.root_bus,
            "link_up" => resolver.link().is_link_up());

        Ok(Self {
            name: res.name,
            root_bus: res.root_bus,
            regs,
            atr,
            resolver,
            router,
            log,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn root_bus(&self) -> u8 {
        self.root_bus
    }
    pub fn atr(&self) -> &AddressTranslationTable {
        &self.atr
    }
    pub fn link(&self) -> &LinkStateGate {
        self.resolver.link()
    }
    pub fn resolver(&self) -> &ConfigSpaceResolver {
        &self.resolver
    }
    pub fn router(&self) -> &InterruptRouter {
        &self.router
    }

    /// Address of a config register, or `None` if the function must be
    /// treated as absent.
    pub fn resolve(&self, bus: u8, devfn: DevFn, offset: u16) -> Option<u64> {
        self.resolver.resolve(bus, devfn, offset)
    }

    /// Offset into the ECAM block for an access of `width` bytes.
    fn ecam_index(
        &self,
        bus: u8,
        devfn: DevFn,
        offset: u16,
        width: Width,
    ) -> Option<usize> {
        if !width.is_aligned(offset as usize) {
            return None;
        }
        let addr = self.resolve(bus, devfn, offset)?;
        let off = (addr - self.resolver.window().base) as usize;
        if off + width.bytes() > self.regs.ecam.len() {
            return None;
        }
        Some(off)
    }

    /// Read a config register. Accesses which do not resolve complete with
    /// all-ones, as an absent function would.
    pub fn config_read(
        &self,
        bus: u8,
        devfn: DevFn,
        offset: u16,
        width: Width,
    ) -> u32 {
        let Some(off) = self.ecam_index(bus, devfn, offset, width) else {
            return width.all_ones();
        };
        let ecam = &self.regs.ecam;
        match width {
            Width::Byte => ecam.read8(off) as u32,
            Width::Word => ecam.read16(off) as u32,
            Width::Dword => ecam.read32(off),
        }
    }

    /// Write a config register. Accesses which do not resolve are dropped.
    pub fn config_write(
        &self,
        bus: u8,
        devfn: DevFn,
        offset: u16,
        width: Width,
        val: u32,
    ) {
        let Some(off) = self.ecam_index(bus, devfn, offset, width) else {
            slog::debug!(self.log, "dropped config write";
                "bus" => bus, "devfn" => %devfn, "offset" => offset);
            return;
        };
        let ecam = &self.regs.ecam;
        match width {
            Width::Byte => ecam.write8(off, val as u8),
            Width::Word => ecam.write16(off, val as u16),
            Width::Dword => ecam.write32(off, val),
        }
    }

    /// Assign an MSI vector to the function at `bdf`, programming its MSI
    /// capability.
    pub fn setup_msi(
        &self,
        bdf: Bdf,
    ) -> Result<LogicalInterrupt, BridgeError> {
        let target = CfgMsiTarget::probe(self, bdf)
            .ok_or(BridgeError::NoMsiCapability(bdf))?;
        Ok(self.router.setup_irq(&target)?)
    }

    /// Entry point for the bridge's physical interrupt line.
    pub fn handle_interrupt(&self) -> IrqReturn {
        self.router.handle()
    }

    /// Mask interrupts and disable every translation slot.
    pub fn detach(mut self) {
        self.regs.bridge.write32(bits::BRIDGE_IMASK_LOCAL, 0);
        for slot in 0..self.atr.slot_count() {
            if let Err(e) = self.atr.unprogram(slot) {
                slog::error!(self.log, "failed to disable slot";
                    "slot" => slot, "error" => %e);
            }
        }
        slog::info!(self.log, "root port detached");
    }
}
