// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demultiplexing of the bridge interrupt line into INTx and MSI.
//!
//! Mapping tables hold the raw value of the bound [`VirqId`], with zero
//! meaning "unmapped". Dispatch only loads from them, so it never takes a
//! lock that a setup or teardown caller might hold.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::bits::{self, LocalIntr};
use super::msi::{
    MsiError, MsiVectorAllocator, MsiVectorId, MSI_VECTOR_COUNT,
};
use super::BridgePort;
use crate::common::Width;
use crate::hw::pci::bits as pci_bits;
use crate::hw::pci::{self, Bdf, INTxPinID, INTX_COUNT};
use crate::intr_pins::{
    IrqDomain, IrqReturn, IrqSink, LogicalInterrupt, VirqId,
};
use crate::mmio::RegisterBlock;
use crate::util::bits::{low_mask, SetBits};

use thiserror::Error;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IrqError {
    #[error("MSI has not been enabled on this bridge")]
    MsiDisabled,

    #[error("MSI vector allocation failed: {0}")]
    Msi(#[from] MsiError),

    /// Teardown of an interrupt which is not currently mapped
    #[error("{domain} interrupt {hwirq} is not mapped")]
    DoubleFree { domain: IrqDomain, hwirq: u32 },

    /// Writing the MSI message into the device failed
    #[error("failed to program MSI message: {0}")]
    Program(String),
}

/// Message a device writes to raise an MSI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MsiMessage {
    pub address_lo: u32,
    pub address_hi: u32,
    pub data: u32,
}

impl MsiMessage {
    pub const fn for_vector(vector: MsiVectorId) -> Self {
        Self {
            address_lo: bits::BRIDGE_MSI_MSG_ADDR as u32,
            address_hi: 0,
            data: vector.get(),
        }
    }
}

/// A device function which can be handed an MSI message.
pub trait MsiTarget {
    fn bdf(&self) -> Bdf;
    fn write_msi_msg(&self, msg: &MsiMessage) -> Result<(), String>;
}

pub struct InterruptRouter {
    bridge: Arc<dyn RegisterBlock>,
    ecam: Arc<dyn RegisterBlock>,
    /// ECAM offset of the root port's own config header
    root_cfg: usize,
    sink: Arc<dyn IrqSink>,

    legacy: [AtomicU32; INTX_COUNT],
    msi: Box<[AtomicU32]>,
    vectors: MsiVectorAllocator,
    msi_enabled: AtomicBool,
    next_virq: AtomicU32,

    log: slog::Logger,
}

impl InterruptRouter {
    pub fn new(
        bridge: Arc<dyn RegisterBlock>,
        ecam: Arc<dyn RegisterBlock>,
        root_bus: u8,
        sink: Arc<dyn IrqSink>,
        log: slog::Logger,
    ) -> Self {
        let vectors = MsiVectorAllocator::new(MSI_VECTOR_COUNT);
        let msi =
            (0..vectors.capacity()).map(|_| AtomicU32::new(0)).collect();
        Self {
            bridge,
            ecam,
            root_cfg: pci::ecam_offset(root_bus, pci::DevFn::ZERO, 0),
            sink,
            legacy: Default::default(),
            msi,
            vectors,
            msi_enabled: AtomicBool::new(false),
            next_virq: AtomicU32::new(1),
            log,
        }
    }

    fn mint_virq(&self) -> VirqId {
        loop {
            // Zero is reserved for "unmapped" and is skipped on wrap
            let raw = self.next_virq.fetch_add(1, Ordering::Relaxed);
            if let Some(virq) = VirqId::from_raw(raw) {
                return virq;
            }
        }
    }

    fn table(&self, domain: IrqDomain) -> &[AtomicU32] {
        match domain {
            IrqDomain::Legacy => &self.legacy[..],
            IrqDomain::Msi => &self.msi[..],
        }
    }

    /// Logical interrupt currently bound to `hwirq` in `domain`.
    pub fn find_mapping(
        &self,
        domain: IrqDomain,
        hwirq: u32,
    ) -> Option<LogicalInterrupt> {
        let slot = self.table(domain).get(hwirq as usize)?;
        let virq = VirqId::from_raw(slot.load(Ordering::Acquire))?;
        Some(LogicalInterrupt { domain, hw_index: hwirq, virq })
    }

    /// Bind a legacy INTx line, or return the existing binding.
    pub fn map_legacy(&self, pin: INTxPinID) -> LogicalInterrupt {
        let line = pin.line();
        if let Some(irq) = self.find_mapping(IrqDomain::Legacy, line) {
            return irq;
        }

        let fresh = self.mint_virq();
        let virq = match self.legacy[line as usize].compare_exchange(
            0,
            fresh.get(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                slog::debug!(self.log, "mapped legacy interrupt";
                    "line" => line, "virq" => fresh.get());
                fresh
            }
            // Lost a race with another mapper; theirs stands
            Err(existing) => VirqId::from_raw(existing).unwrap_or(fresh),
        };
        LogicalInterrupt { domain: IrqDomain::Legacy, hw_index: line, virq }
    }

    /// Point the root port's MSI capability at the bridge's message
    /// register and enable it. Must precede any [`Self::setup_irq`].
    pub fn enable_msi(&self) {
        let ctrl = self.root_cfg + bits::ECAM_MSI_CAP_CTRL;
        let cur = self.ecam.read32(ctrl);
        self.ecam.write32(ctrl, cur | bits::MSI_CAP_CTRL_ENABLE);
        self.ecam.write32(
            self.root_cfg + bits::ECAM_MSI_MSG_ADDR,
            bits::BRIDGE_MSI_MSG_ADDR as u32,
        );
        self.msi_enabled.store(true, Ordering::Release);
        slog::info!(self.log, "MSI enabled";
            "vectors" => self.vectors.capacity());
    }

    pub fn is_msi_enabled(&self) -> bool {
        self.msi_enabled.load(Ordering::Acquire)
    }

    pub fn vectors(&self) -> &MsiVectorAllocator {
        &self.vectors
    }

    /// Allocate an MSI vector for `target` and program its message.
    pub fn setup_irq(
        &self,
        target: &dyn MsiTarget,
    ) -> Result<LogicalInterrupt, IrqError> {
        if !self.is_msi_enabled() {
            return Err(IrqError::MsiDisabled);
        }
        let vector = self.vectors.allocate()?;
        let virq = self.mint_virq();

        // The mapping is in place before the device can raise the vector
        let slot = &self.msi[vector.get() as usize];
        slot.store(virq.get(), Ordering::Release);

        let msg = MsiMessage::for_vector(vector);
        if let Err(e) = target.write_msi_msg(&msg) {
            slot.store(0, Ordering::Release);
            self.vectors.free(vector)?;
            slog::warn!(self.log, "MSI programming failed";
                "bdf" => %target.bdf(), "vector" => vector.get(),
                "error" => %e);
            return Err(IrqError::Program(e));
        }

        slog::info!(self.log, "MSI assigned";
            "bdf" => %target.bdf(), "vector" => vector.get(),
            "virq" => virq.get());
        Ok(LogicalInterrupt {
            domain: IrqDomain::Msi,
            hw_index: vector.get(),
            virq,
        })
    }

    /// Release a mapping made by [`Self::setup_irq`] or
    /// [`Self::map_legacy`].
    pub fn teardown_irq(&self, irq: LogicalInterrupt) -> Result<(), IrqError> {
        let double_free =
            IrqError::DoubleFree { domain: irq.domain, hwirq: irq.hw_index };

        let Some(slot) = self.table(irq.domain).get(irq.hw_index as usize)
        else {
            return Err(match irq.domain {
                IrqDomain::Msi => MsiError::OutOfRange(MsiVectorId::new(
                    irq.hw_index,
                ))
                .into(),
                IrqDomain::Legacy => double_free,
            });
        };

        if slot
            .compare_exchange(
                irq.virq.get(),
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            slog::error!(self.log, "trying to free unused interrupt";
                "domain" => %irq.domain, "hwirq" => irq.hw_index);
            return Err(double_free);
        }

        if irq.domain == IrqDomain::Msi {
            self.vectors.free(MsiVectorId::new(irq.hw_index))?;
        }
        slog::debug!(self.log, "interrupt released"; "irq" => %irq);
        Ok(())
    }

    fn dispatch(&self, domain: IrqDomain, hwirq: u32) {
        match self.find_mapping(domain, hwirq) {
            Some(irq) => self.sink.fire(irq),
            None => {
                slog::error!(self.log, "unexpected interrupt";
                    "domain" => %domain, "hwirq" => hwirq);
            }
        }
    }

    /// Service one assertion of the bridge's interrupt line.
    ///
    /// Each pending source is cleared with a write of its bit alone, so a
    /// source asserted between the status read and the clear stays pending
    /// for the next pass.
    pub fn handle(&self) -> IrqReturn {
        let status = self.bridge.read32(bits::BRIDGE_ISTATUS_LOCAL);
        let intx = (status & LocalIntr::INTX.bits()) >> bits::LOCAL_INTX_SHIFT;
        for line in SetBits::new(intx as u64) {
            self.bridge.write32(
                bits::BRIDGE_ISTATUS_LOCAL,
                1 << (line + bits::LOCAL_INTX_SHIFT),
            );
            self.dispatch(IrqDomain::Legacy, line);
        }

        let status = self.bridge.read32(bits::BRIDGE_ISTATUS_LOCAL);
        if status & LocalIntr::MSI.bits() != 0 {
            self.bridge
                .write32(bits::BRIDGE_ISTATUS_LOCAL, LocalIntr::MSI.bits());
            let pending = self.bridge.read32(bits::BRIDGE_ISTATUS_MSI) as u64
                & low_mask(self.vectors.capacity());
            for vector in SetBits::new(pending) {
                self.bridge.write32(bits::BRIDGE_ISTATUS_MSI, 1 << vector);
                self.dispatch(IrqDomain::Msi, vector);
            }
        }

        IrqReturn::Handled
    }
}

/// MSI target reached through a root port's configuration space.
pub struct CfgMsiTarget<'a> {
    port: &'a BridgePort,
    bdf: Bdf,
    cap: u16,
    ctrl: pci_bits::MsiCtrl,
}

impl<'a> CfgMsiTarget<'a> {
    /// Find the MSI capability of the function at `bdf`.
    pub fn probe(port: &'a BridgePort, bdf: Bdf) -> Option<Self> {
        let read = |off: usize, width| {
            port.config_read(bdf.bus.get(), bdf.devfn(), off as u16, width)
        };

        let vendor = read(pci_bits::OFFSET_VENDOR_ID, Width::Word);
        if vendor == pci_bits::VENDOR_ID_NONE as u32 {
            return None;
        }
        let status = pci_bits::RegStatus::from_bits_truncate(
            read(pci_bits::OFFSET_STATUS, Width::Word) as u16,
        );
        if !status.contains(pci_bits::RegStatus::CAP_LIST) {
            return None;
        }

        let mut ptr =
            read(pci_bits::OFFSET_CAP_PTR, Width::Byte) as usize & !0x3;
        // Bounded walk in case the list loops
        for _ in 0..48 {
            // Capabilities live past the standard header
            if ptr < 0x40 || ptr >= pci_bits::LEN_CFG {
                return None;
            }
            if read(ptr, Width::Byte) as u8 == pci_bits::CAP_ID_MSI {
                let ctrl = pci_bits::MsiCtrl::from_bits_truncate(
                    read(ptr + pci_bits::MSI_OFFSET_CTRL, Width::Word) as u16,
                );
                return Some(Self { port, bdf, cap: ptr as u16, ctrl });
            }
            ptr = read(ptr + 1, Width::Byte) as usize & !0x3;
        }
        None
    }

    fn write(&self, off: usize, width: Width, val: u32) {
        self.port.config_write(
            self.bdf.bus.get(),
            self.bdf.devfn(),
            self.cap + off as u16,
            width,
            val,
        );
    }
}

impl MsiTarget for CfgMsiTarget<'_> {
    fn bdf(&self) -> Bdf {
        self.bdf
    }

    fn write_msi_msg(&self, msg: &MsiMessage) -> Result<(), String> {
        let bus = self.bdf.bus.get();
        if self.port.resolve(bus, self.bdf.devfn(), self.cap).is_none() {
            return Err(format!("{} is not reachable", self.bdf));
        }

        let is_64 = self.ctrl.contains(pci_bits::MsiCtrl::ADDR_64);
        if !is_64 && msg.address_hi != 0 {
            return Err(format!("{} takes 32-bit MSI addresses", self.bdf));
        }

        self.write(pci_bits::MSI_OFFSET_ADDR_LO, Width::Dword, msg.address_lo);
        let data_off = if is_64 {
            self.write(
                pci_bits::MSI_OFFSET_ADDR_HI,
                Width::Dword,
                msg.address_hi,
            );
            pci_bits::MSI_OFFSET_DATA_64
        } else {
            pci_bits::MSI_OFFSET_DATA_32
        };
        self.write(data_off, Width::Word, msg.data);

        let ctrl = self.ctrl | pci_bits::MsiCtrl::ENABLE;
        self.write(pci_bits::MSI_OFFSET_CTRL, Width::Word, ctrl.bits() as u32);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hw::sim::{RecordingSink, SimBridge};

    struct Fixture {
        sim: SimBridge,
        sink: Arc<RecordingSink>,
        router: InterruptRouter,
    }

    fn fixture() -> Fixture {
        let sim = SimBridge::new(0, 1 << 20);
        let sink = RecordingSink::new();
        let router = InterruptRouter::new(
            sim.bridge.clone(),
            sim.ecam.clone(),
            0,
            sink.clone(),
            slog::Logger::root(slog::Discard, slog::o!()),
        );
        Fixture { sim, sink, router }
    }

    /// Accepts any message and remembers it.
    struct FakeTarget {
        bdf: Bdf,
        fail: bool,
        last: std::sync::Mutex<Option<MsiMessage>>,
    }

    impl FakeTarget {
        fn new(fail: bool) -> Self {
            Self {
                bdf: Bdf::new(1, 0, 0).unwrap(),
                fail,
                last: std::sync::Mutex::new(None),
            }
        }
    }

    impl MsiTarget for FakeTarget {
        fn bdf(&self) -> Bdf {
            self.bdf
        }
        fn write_msi_msg(&self, msg: &MsiMessage) -> Result<(), String> {
            if self.fail {
                return Err("device went away".to_string());
            }
            *self.last.lock().unwrap() = Some(*msg);
            Ok(())
        }
    }

    #[test]
    fn legacy_mapping_idempotent() {
        let fx = fixture();
        let a = fx.router.map_legacy(INTxPinID::IntA);
        let again = fx.router.map_legacy(INTxPinID::IntA);
        let c = fx.router.map_legacy(INTxPinID::IntC);
        assert_eq!(a, again);
        assert_eq!(a.hw_index, 0);
        assert_eq!(c.hw_index, 2);
        assert_ne!(a.virq, c.virq);
        assert_eq!(fx.router.find_mapping(IrqDomain::Legacy, 2), Some(c));
        assert_eq!(fx.router.find_mapping(IrqDomain::Legacy, 1), None);
    }

    #[test]
    fn intx_ascending_individual_clears() {
        let fx = fixture();
        let b = fx.router.map_legacy(INTxPinID::IntB);
        let d = fx.router.map_legacy(INTxPinID::IntD);
        fx.sim.raise_intx(INTxPinID::IntD);
        fx.sim.raise_intx(INTxPinID::IntB);
        fx.sim.bridge.take_writes();

        assert_eq!(fx.router.handle(), IrqReturn::Handled);
        assert_eq!(fx.sink.take(), vec![b, d]);
        assert_eq!(
            fx.sim.bridge.writes_to(bits::BRIDGE_ISTATUS_LOCAL),
            vec![1 << 25, 1 << 27]
        );
        assert_eq!(fx.sim.bridge.get(bits::BRIDGE_ISTATUS_LOCAL), 0);
    }

    #[test]
    fn unmapped_sources_do_not_stop_dispatch() {
        let fx = fixture();
        let d = fx.router.map_legacy(INTxPinID::IntD);
        fx.router.enable_msi();
        let target = FakeTarget::new(false);
        let msi = fx.router.setup_irq(&target).unwrap();

        fx.sim.raise_intx(INTxPinID::IntA);
        fx.sim.raise_intx(INTxPinID::IntD);
        fx.sim.raise_msi(3);
        fx.sim.raise_msi(msi.hw_index);

        assert_eq!(fx.router.handle(), IrqReturn::Handled);
        assert_eq!(fx.sink.take(), vec![d, msi]);
        // Every source acknowledged, mapped or not
        assert_eq!(fx.sim.bridge.get(bits::BRIDGE_ISTATUS_LOCAL), 0);
        assert_eq!(fx.sim.bridge.get(bits::BRIDGE_ISTATUS_MSI), 0);
    }

    #[test]
    fn msi_dispatch_order_and_clears() {
        let fx = fixture();
        fx.router.enable_msi();
        let target = FakeTarget::new(false);
        let irqs: Vec<_> =
            (0..4).map(|_| fx.router.setup_irq(&target).unwrap()).collect();
        assert_eq!(
            irqs.iter().map(|i| i.hw_index).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(
            *target.last.lock().unwrap(),
            Some(MsiMessage { address_lo: 0x190, address_hi: 0, data: 3 })
        );

        fx.sim.raise_msi(2);
        fx.sim.raise_msi(0);
        fx.sim.bridge.take_writes();
        fx.router.handle();

        assert_eq!(fx.sink.take(), vec![irqs[0], irqs[2]]);
        assert_eq!(
            fx.sim.bridge.take_writes(),
            vec![
                (bits::BRIDGE_ISTATUS_LOCAL, LocalIntr::MSI.bits()),
                (bits::BRIDGE_ISTATUS_MSI, 1 << 0),
                (bits::BRIDGE_ISTATUS_MSI, 1 << 2),
            ]
        );
    }

    #[test]
    fn msi_requires_enable() {
        let fx = fixture();
        let target = FakeTarget::new(false);
        assert_eq!(fx.router.setup_irq(&target), Err(IrqError::MsiDisabled));

        fx.router.enable_msi();
        let cap = fx.sim.ecam.get(bits::ECAM_MSI_CAP_CTRL);
        assert_eq!(cap & bits::MSI_CAP_CTRL_ENABLE, bits::MSI_CAP_CTRL_ENABLE);
        assert_eq!(fx.sim.ecam.get(bits::ECAM_MSI_MSG_ADDR), 0x190);
        assert!(fx.router.is_msi_enabled());
    }

    #[test]
    fn failed_programming_releases_vector() {
        let fx = fixture();
        fx.router.enable_msi();
        let bad = FakeTarget::new(true);
        assert!(matches!(
            fx.router.setup_irq(&bad),
            Err(IrqError::Program(_))
        ));
        assert_eq!(fx.router.vectors().allocated_count(), 0);
        assert_eq!(fx.router.find_mapping(IrqDomain::Msi, 0), None);
    }

    #[test]
    fn teardown_and_double_free() {
        let fx = fixture();
        fx.router.enable_msi();
        let target = FakeTarget::new(false);
        let irq = fx.router.setup_irq(&target).unwrap();

        fx.router.teardown_irq(irq).unwrap();
        assert!(!fx.router.vectors().is_allocated(MsiVectorId::new(0)));
        assert_eq!(
            fx.router.teardown_irq(irq),
            Err(IrqError::DoubleFree { domain: IrqDomain::Msi, hwirq: 0 })
        );

        // A stale handle for a recycled vector is refused too
        let fresh = fx.router.setup_irq(&target).unwrap();
        assert_eq!(fresh.hw_index, irq.hw_index);
        assert!(fx.router.teardown_irq(irq).is_err());
        assert!(fx.router.vectors().is_allocated(MsiVectorId::new(0)));

        let legacy = fx.router.map_legacy(INTxPinID::IntB);
        fx.router.teardown_irq(legacy).unwrap();
        assert_eq!(
            fx.router.teardown_irq(legacy),
            Err(IrqError::DoubleFree { domain: IrqDomain::Legacy, hwirq: 1 })
        );

        let bogus = LogicalInterrupt { hw_index: 40, ..fresh };
        assert_eq!(
            fx.router.teardown_irq(bogus),
            Err(IrqError::Msi(MsiError::OutOfRange(MsiVectorId::new(40))))
        );
    }
}
