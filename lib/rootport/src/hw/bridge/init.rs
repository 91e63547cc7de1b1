// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use super::atr::{self, AddressTranslationTable, RegionKind};
use super::intr::InterruptRouter;
use super::{bits, BridgeError, BridgeRegs, PortResources};
use crate::common::AddressRange;
use crate::hw::pci::{self, bits as pci_bits, DevFn};

/// One-shot hardware bring-up of a root port.
///
/// Interrupts stay masked until every translation slot is programmed, and
/// any failure leaves them masked: a failed bring-up is fatal to attach.
pub struct BridgeInitializer<'a> {
    regs: &'a BridgeRegs,
    res: &'a PortResources,
    log: &'a slog::Logger,
}

impl<'a> BridgeInitializer<'a> {
    pub fn new(
        regs: &'a BridgeRegs,
        res: &'a PortResources,
        log: &'a slog::Logger,
    ) -> Self {
        Self { regs, res, log }
    }

    pub fn run(
        &self,
        atr: &mut AddressTranslationTable,
        router: &InterruptRouter,
    ) -> Result<(), BridgeError> {
        self.quiesce_errors();
        self.mask_and_clear();
        slog::info!(self.log, "interrupts disabled");

        self.program_config_window(atr)?;
        self.program_ranges(atr)?;
        self.open_inbound_window();
        self.set_identity();

        self.regs
            .bridge
            .write32(bits::BRIDGE_IMASK_LOCAL, bits::IMASK_LOCAL_ENABLE);
        slog::info!(self.log, "interrupts enabled";
            "mask" => format!("{:#x}", bits::IMASK_LOCAL_ENABLE));

        if self.res.msi {
            router.enable_msi();
        }
        Ok(())
    }

    fn quiesce_errors(&self) {
        let ctrl = &self.regs.ctrl;
        ctrl.write32(bits::CTRL_ECC_CONTROL, bits::ECC_CONTROL_DISABLE);
        ctrl.write32(bits::CTRL_PCIE_EVENT_INT, bits::PCIE_EVENT_INT_ALL);
        ctrl.write32(bits::CTRL_SEC_ERROR_INT, bits::ERROR_INT_ALL);
        ctrl.write32(bits::CTRL_SEC_ERROR_INT_MASK, bits::ERROR_INT_ALL);
        ctrl.write32(bits::CTRL_DED_ERROR_INT, bits::ERROR_INT_ALL);
        ctrl.write32(bits::CTRL_DED_ERROR_INT_MASK, bits::ERROR_INT_ALL);
    }

    fn mask_and_clear(&self) {
        let bridge = &self.regs.bridge;
        bridge.write32(bits::BRIDGE_IMASK_LOCAL, 0);
        bridge.write32(bits::BRIDGE_ISTATUS_LOCAL, !0);
        bridge.write32(bits::BRIDGE_IMASK_HOST, 0);
        bridge.write32(bits::BRIDGE_ISTATUS_HOST, !0);
        // Vectors left pending from before attach would otherwise be
        // reported as unexpected on the first dispatch
        bridge.write32(bits::BRIDGE_ISTATUS_MSI, !0);
    }

    /// Slot 0 carries configuration requests. The window is widened to the
    /// enclosing power of two, and translates onto itself.
    fn program_config_window(
        &self,
        atr: &mut AddressTranslationTable,
    ) -> Result<(), BridgeError> {
        let window = self.res.config_window;
        let size = atr::enclosing_window_size(window.size)
            .ok_or(BridgeError::MissingConfigWindow)?;
        atr.program(
            0,
            window.base,
            size,
            window.base,
            RegionKind::ConfigSpace,
        )?;
        slog::info!(self.log, "config window programmed";
            "slot" => 0, "window" => %AddressRange::new(window.base, size));
        Ok(())
    }

    fn program_ranges(
        &self,
        atr: &mut AddressTranslationTable,
    ) -> Result<(), BridgeError> {
        let mut next = 1;
        for range in &self.res.ranges {
            if !range.kind.is_mem() {
                slog::debug!(self.log, "skipping non-memory range";
                    "kind" => ?range.kind, "cpu_addr" => range.cpu_addr);
                continue;
            }
            let slot = atr.free_slot(next).ok_or(BridgeError::NoFreeSlot {
                range: range.cpu_range(),
            })?;
            atr.program(
                slot,
                range.cpu_addr,
                range.size,
                range.pci_addr,
                RegionKind::TxRx,
            )?;
            slog::info!(self.log, "memory window programmed";
                "slot" => slot,
                "window" => %range.cpu_range(),
                "pci_addr" => format!("{:#x}", range.pci_addr));
            next = slot + 1;
        }
        Ok(())
    }

    /// Let inbound (device to host) transactions through untranslated.
    fn open_inbound_window(&self) {
        let bridge = &self.regs.bridge;
        bridge
            .set_bits32(bits::BRIDGE_PCIE_WIN0_PARAM, bits::PCIE_WIN0_PASSTHRU);
        bridge.write32(bits::BRIDGE_PCIE_WIN0_ADDR, 0);
    }

    /// Present the root port as a PCI-PCI bridge and assign its bus numbers.
    fn set_identity(&self) {
        let bridge = &self.regs.bridge;
        let ids = bridge.read32(bits::BRIDGE_PCIE_PCI_IDS_DW1);
        bridge.write32(
            bits::BRIDGE_PCIE_PCI_IDS_DW1,
            (ids & 0xffff) | (pci_bits::CLASS_CODE_BRIDGE_PCI as u32) << 16,
        );

        let root = self.res.root_bus;
        let busnums =
            0xff << 16 | (root.saturating_add(1) as u32) << 8 | root as u32;
        let hdr = pci::ecam_offset(root, DevFn::ZERO, 0);
        self.regs.ecam.write32(hdr + pci_bits::OFFSET_PRIMARY_BUS, busnums);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::MB;
    use crate::hw::bridge::{PciRange, RangeKind};
    use crate::hw::sim::{RecordingSink, SimBridge};

    fn resources(ranges: Vec<PciRange>, slots: usize) -> PortResources {
        PortResources {
            name: "pcie0".to_string(),
            root_bus: 0,
            config_window: AddressRange::new(0x3000_0000, 256 * MB),
            ranges,
            atr_slots: slots,
            msi: false,
        }
    }

    fn mem(cpu_addr: u64, size: u64) -> PciRange {
        PciRange { kind: RangeKind::Mem, cpu_addr, pci_addr: 0, size }
    }

    struct Outcome {
        atr: AddressTranslationTable,
        router: InterruptRouter,
        result: Result<(), BridgeError>,
    }

    fn run(sim: &SimBridge, res: &PortResources) -> Outcome {
        let regs = sim.regs();
        let log = slog::Logger::root(slog::Discard, slog::o!());
        let mut atr =
            AddressTranslationTable::new(regs.bridge.clone(), res.atr_slots)
                .unwrap();
        let router = InterruptRouter::new(
            regs.bridge.clone(),
            regs.ecam.clone(),
            res.root_bus,
            RecordingSink::new(),
            log.clone(),
        );
        let result =
            BridgeInitializer::new(&regs, res, &log).run(&mut atr, &router);
        Outcome { atr, router, result }
    }

    #[test]
    fn bring_up_sequence() {
        let sim = SimBridge::new(0, 1 << 24);
        sim.bridge.raise(bits::BRIDGE_ISTATUS_MSI, 0x8000_0001);
        sim.bridge.raise(bits::BRIDGE_ISTATUS_LOCAL, 0x0100_0000);

        let res = resources(vec![mem(0x4000_0000, 64 * MB)], 2);
        let Outcome { atr, result, .. } = run(&sim, &res);
        result.unwrap();

        assert_eq!(
            sim.ctrl.writes(),
            vec![
                (bits::CTRL_ECC_CONTROL, 0x0f00_0000),
                (bits::CTRL_PCIE_EVENT_INT, 0x0007_0007),
                (bits::CTRL_SEC_ERROR_INT, 0xffff),
                (bits::CTRL_SEC_ERROR_INT_MASK, 0xffff),
                (bits::CTRL_DED_ERROR_INT, 0xffff),
                (bits::CTRL_DED_ERROR_INT_MASK, 0xffff),
            ]
        );

        // Masked first, unmasked last
        let masks = sim.bridge.writes_to(bits::BRIDGE_IMASK_LOCAL);
        assert_eq!(masks, vec![0, 0x1f00_0000]);
        let writes = sim.bridge.writes();
        assert_eq!(writes.first(), Some(&(bits::BRIDGE_IMASK_LOCAL, 0)));
        assert_eq!(
            writes.last(),
            Some(&(bits::BRIDGE_IMASK_LOCAL, 0x1f00_0000))
        );

        assert_eq!(sim.bridge.get(bits::BRIDGE_ISTATUS_MSI), 0);
        assert_eq!(sim.bridge.get(bits::BRIDGE_ISTATUS_LOCAL), 0);
        assert_eq!(atr.hw_param(0), Ok(0x3000_0037));
        assert_eq!(atr.hw_param(1), Ok(0x4000_0033));
        assert_eq!(sim.bridge.get(bits::BRIDGE_PCIE_WIN0_PARAM), 0x3e);
        assert_eq!(sim.bridge.get(bits::BRIDGE_PCIE_PCI_IDS_DW1), 0x0604_0001);
        assert_eq!(sim.ecam.get(pci_bits::OFFSET_PRIMARY_BUS), 0x00ff_0100);
    }

    #[test]
    fn config_window_rounded_up() {
        let sim = SimBridge::new(0, 1 << 24);
        let mut res = resources(vec![], 1);
        res.config_window = AddressRange::new(0x3000_0000, 200 * MB);
        let Outcome { atr, result, .. } = run(&sim, &res);
        result.unwrap();
        assert_eq!(atr.region(0).unwrap().source_size, 256 * MB);
    }

    #[test]
    fn io_ranges_skipped() {
        let sim = SimBridge::new(0, 1 << 24);
        let io = PciRange {
            kind: RangeKind::Io,
            cpu_addr: 0x5000_0000,
            pci_addr: 0,
            size: 64 * 1024,
        };
        let pref = PciRange {
            kind: RangeKind::PrefetchMem,
            cpu_addr: 0x6000_0000,
            pci_addr: 0x6000_0000,
            size: 16 * MB,
        };
        let res = resources(vec![io, mem(0x4000_0000, 64 * MB), pref], 3);
        let Outcome { atr, result, .. } = run(&sim, &res);
        result.unwrap();
        assert_eq!(atr.enabled_regions().count(), 3);
        assert_eq!(atr.region(2).unwrap().source_base, 0x6000_0000);
    }

    #[test]
    fn fatal_errors_leave_interrupts_masked() {
        let sim = SimBridge::new(0, 1 << 24);
        let res = resources(
            vec![mem(0x4000_0000, 64 * MB), mem(0x8000_0000, 4 * MB)],
            2,
        );
        let out = run(&sim, &res).result;
        assert_eq!(
            out,
            Err(BridgeError::NoFreeSlot {
                range: AddressRange::new(0x8000_0000, 4 * MB)
            })
        );
        assert_eq!(sim.bridge.writes_to(bits::BRIDGE_IMASK_LOCAL), vec![0]);

        let sim = SimBridge::new(0, 1 << 24);
        let res = resources(vec![mem(0x4000_0000, 48 * MB)], 2);
        let out = run(&sim, &res).result;
        assert!(matches!(
            out,
            Err(BridgeError::Atr(atr::AtrError::InvalidWindowSize { .. }))
        ));
        assert_eq!(sim.bridge.writes_to(bits::BRIDGE_IMASK_LOCAL), vec![0]);

        let sim = SimBridge::new(0, 1 << 24);
        let mut res = resources(vec![], 2);
        res.config_window.size = 0;
        let out = run(&sim, &res).result;
        assert_eq!(out, Err(BridgeError::MissingConfigWindow));
    }

    #[test]
    fn msi_enabled_last() {
        let sim = SimBridge::new(0, 1 << 24);
        let mut res = resources(vec![mem(0x4000_0000, 64 * MB)], 2);
        res.msi = true;
        let Outcome { router, result, .. } = run(&sim, &res);
        result.unwrap();

        assert!(router.is_msi_enabled());
        let ctrl = sim.ecam.get(bits::ECAM_MSI_CAP_CTRL);
        assert_eq!(ctrl & bits::MSI_CAP_CTRL_ENABLE, bits::MSI_CAP_CTRL_ENABLE);
        assert_eq!(sim.ecam.get(bits::ECAM_MSI_MSG_ADDR), 0x190);
        assert_eq!(
            sim.ecam.writes().last(),
            Some(&(bits::ECAM_MSI_MSG_ADDR, 0x190))
        );

        // A failed bring-up never gets as far as MSI
        let sim = SimBridge::new(0, 1 << 24);
        let mut res = resources(vec![mem(0x4000_0000, 48 * MB)], 2);
        res.msi = true;
        let Outcome { router, result, .. } = run(&sim, &res);
        assert!(result.is_err());
        assert!(!router.is_msi_enabled());
        assert!(sim.ecam.writes_to(bits::ECAM_MSI_MSG_ADDR).is_empty());
    }
}
