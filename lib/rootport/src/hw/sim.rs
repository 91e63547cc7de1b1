// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated bridge hardware.
//!
//! Register files here behave like the real blocks closely enough to drive
//! bring-up, config-space enumeration and interrupt dispatch without
//! silicon: status registers are write-1-to-clear, unpopulated ECAM space
//! reads as all-ones, and every write is logged so tests can check exactly
//! which bits were cleared.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::bridge::{bits, BridgeRegs};
use super::pci::{self, bits as pci_bits, Bdf, DevFn, INTxPinID};
use crate::intr_pins::{IrqSink, LogicalInterrupt};
use crate::mmio::RegisterBlock;

#[derive(Default)]
struct Inner {
    regs: BTreeMap<usize, u32>,
    w1c: BTreeSet<usize>,
    log: Vec<(usize, u32)>,
}

/// A sparse register file.
pub struct SimRegs {
    len: usize,
    fill: u32,
    inner: Mutex<Inner>,
}

impl SimRegs {
    /// Register file of `len` bytes whose registers read as zero until
    /// written.
    pub fn new(len: usize) -> Self {
        Self::with_fill(len, 0)
    }

    /// Register file whose unwritten registers read as `fill`.
    pub fn with_fill(len: usize, fill: u32) -> Self {
        Self { len, fill, inner: Mutex::new(Inner::default()) }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A test which panicked while holding the lock leaves the register
        // contents intact, so keep going.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(&self, offset: usize) {
        assert!(offset + 4 <= self.len, "offset {offset:#x} out of bounds");
        assert_eq!(offset & 0x3, 0, "misaligned offset {offset:#x}");
    }

    /// Mark the register at `offset` as write-1-to-clear.
    pub fn set_w1c(&self, offset: usize) {
        self.check(offset);
        self.lock().w1c.insert(offset);
    }

    /// Store a value as the hardware would, bypassing write semantics and
    /// the write log.
    pub fn set(&self, offset: usize, val: u32) {
        self.check(offset);
        self.lock().regs.insert(offset, val);
    }

    /// Current register contents, without side effects.
    pub fn get(&self, offset: usize) -> u32 {
        self.check(offset);
        let inner = self.lock();
        inner.regs.get(&offset).copied().unwrap_or(self.fill)
    }

    /// Assert `bits` in a status register from the hardware side.
    pub fn raise(&self, offset: usize, bits: u32) {
        let cur = self.get(offset);
        self.set(offset, cur | bits);
    }

    /// Every driver write so far, as `(offset, value)` in issue order.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.lock().log.clone()
    }

    /// Drain the write log.
    pub fn take_writes(&self) -> Vec<(usize, u32)> {
        std::mem::take(&mut self.lock().log)
    }

    /// Driver writes which targeted `offset`, in issue order.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.lock()
            .log
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, val)| *val)
            .collect()
    }
}

impl RegisterBlock for SimRegs {
    fn len(&self) -> usize {
        self.len
    }
    fn read32(&self, offset: usize) -> u32 {
        self.get(offset)
    }
    fn write32(&self, offset: usize, val: u32) {
        self.check(offset);
        let mut inner = self.lock();
        inner.log.push((offset, val));
        let fill = self.fill;
        let new = if inner.w1c.contains(&offset) {
            inner.regs.get(&offset).copied().unwrap_or(fill) & !val
        } else {
            val
        };
        inner.regs.insert(offset, new);
    }
}

/// Vendor and device ID reported by the simulated root port.
pub const ROOT_PORT_VENDOR_ID: u16 = 0x11aa;
pub const ROOT_PORT_DEVICE_ID: u16 = 0x1556;
/// Offset of the root port's MSI capability.
pub const ROOT_PORT_MSI_CAP: u8 = 0xe0;

/// The three register blocks of one root port.
pub struct SimBridge {
    pub ecam: Arc<SimRegs>,
    pub bridge: Arc<SimRegs>,
    pub ctrl: Arc<SimRegs>,
    root_bus: u8,
}

impl SimBridge {
    /// Build a bridge whose ECAM block spans `ecam_len` bytes, with the root
    /// port's own header at `root_bus`.
    pub fn new(root_bus: u8, ecam_len: usize) -> Self {
        let ecam = Arc::new(SimRegs::with_fill(ecam_len, 0xffff_ffff));

        let bridge = Arc::new(SimRegs::new(bits::LEN_BRIDGE));
        for off in [
            bits::BRIDGE_ISTATUS_LOCAL,
            bits::BRIDGE_ISTATUS_HOST,
            bits::BRIDGE_ISTATUS_MSI,
        ] {
            bridge.set_w1c(off);
        }
        // Revision 1, vendor-default class code
        bridge.set(bits::BRIDGE_PCIE_PCI_IDS_DW1, 0x0000_0001);

        let ctrl = Arc::new(SimRegs::new(bits::LEN_CTRL));
        ctrl.set_w1c(bits::CTRL_SEC_ERROR_INT);
        ctrl.set_w1c(bits::CTRL_DED_ERROR_INT);

        let this = Self { ecam, bridge, ctrl, root_bus };
        this.populate_root_port();
        this
    }

    fn populate_root_port(&self) {
        let base = pci::ecam_offset(self.root_bus, DevFn::ZERO, 0);
        let reg = |off: usize, val: u32| self.ecam.set(base + off, val);

        reg(
            pci_bits::OFFSET_VENDOR_ID,
            (ROOT_PORT_DEVICE_ID as u32) << 16 | ROOT_PORT_VENDOR_ID as u32,
        );
        reg(
            pci_bits::OFFSET_COMMAND,
            (pci_bits::RegStatus::CAP_LIST.bits() as u32) << 16,
        );
        reg(
            pci_bits::OFFSET_CLASS_REV,
            (pci_bits::CLASS_CODE_BRIDGE_PCI as u32) << 16 | 0x1,
        );
        reg(
            pci_bits::OFFSET_HEADER_TYPE & !0x3,
            (pci_bits::HEADER_TYPE_BRIDGE as u32) << 16,
        );
        reg(pci_bits::OFFSET_PRIMARY_BUS, 0);
        reg(pci_bits::OFFSET_CAP_PTR, ROOT_PORT_MSI_CAP as u32);
        reg(
            ROOT_PORT_MSI_CAP as usize,
            msi_cap_header(pci_bits::MsiCtrl::ADDR_64),
        );
        reg(bits::ECAM_MSI_MSG_ADDR, 0);
    }

    /// Register blocks as handed to [`BridgePort::attach`].
    ///
    /// [`BridgePort::attach`]: super::bridge::BridgePort::attach
    pub fn regs(&self) -> BridgeRegs {
        BridgeRegs {
            ecam: self.ecam.clone(),
            bridge: self.bridge.clone(),
            ctrl: self.ctrl.clone(),
        }
    }

    pub fn root_bus(&self) -> u8 {
        self.root_bus
    }

    pub fn set_link_up(&self, up: bool) {
        let state = if up { bits::LTSSM_L0 } else { 0 };
        self.ctrl.set(bits::CTRL_LTSSM_STATE, state);
    }

    /// Assert a legacy INTx line in the local status register.
    pub fn raise_intx(&self, pin: INTxPinID) {
        self.bridge.raise(
            bits::BRIDGE_ISTATUS_LOCAL,
            1 << (bits::LOCAL_INTX_SHIFT + pin.line()),
        );
    }

    /// Deliver an MSI write for `vector`: set its pending bit and the MSI
    /// summary bit.
    pub fn raise_msi(&self, vector: u32) {
        assert!(vector < 32);
        self.bridge.raise(bits::BRIDGE_ISTATUS_MSI, 1 << vector);
        self.bridge
            .raise(bits::BRIDGE_ISTATUS_LOCAL, bits::LocalIntr::MSI.bits());
    }

    /// Place a type 0 endpoint function at `bdf`, optionally carrying an
    /// MSI capability with 64-bit addressing at config offset `msi_cap`.
    pub fn add_endpoint(
        &self,
        bdf: Bdf,
        vendor_id: u16,
        device_id: u16,
        msi_cap: Option<u8>,
    ) {
        let base = pci::ecam_offset(bdf.bus.get(), bdf.devfn(), 0);
        let reg = |off: usize, val: u32| self.ecam.set(base + off, val);

        reg(
            pci_bits::OFFSET_VENDOR_ID,
            (device_id as u32) << 16 | vendor_id as u32,
        );
        // Zero-fill the rest of the standard header
        for off in (pci_bits::OFFSET_COMMAND..pci_bits::LEN_CFG).step_by(4) {
            reg(off, 0);
        }
        reg(pci_bits::OFFSET_CLASS_REV, 0xff00_0000);
        if let Some(cap) = msi_cap {
            let cap = cap as usize & !0x3;
            reg(
                pci_bits::OFFSET_COMMAND,
                (pci_bits::RegStatus::CAP_LIST.bits() as u32) << 16,
            );
            reg(pci_bits::OFFSET_CAP_PTR, cap as u32);
            reg(cap, msi_cap_header(pci_bits::MsiCtrl::ADDR_64));
            reg(cap + pci_bits::MSI_OFFSET_ADDR_LO, 0);
            reg(cap + pci_bits::MSI_OFFSET_ADDR_HI, 0);
            reg(cap + pci_bits::MSI_OFFSET_DATA_64, 0);
        }
    }
}

fn msi_cap_header(ctrl: pci_bits::MsiCtrl) -> u32 {
    (ctrl.bits() as u32) << 16 | pci_bits::CAP_ID_MSI as u32
}

/// Sink which records every fired interrupt, in order.
#[derive(Default)]
pub struct RecordingSink {
    fired: Mutex<Vec<LogicalInterrupt>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
    fn lock(&self) -> MutexGuard<'_, Vec<LogicalInterrupt>> {
        self.fired.lock().unwrap_or_else(|e| e.into_inner())
    }
    pub fn fired(&self) -> Vec<LogicalInterrupt> {
        self.lock().clone()
    }
    pub fn take(&self) -> Vec<LogicalInterrupt> {
        std::mem::take(&mut *self.lock())
    }
}

impl IrqSink for RecordingSink {
    fn fire(&self, irq: LogicalInterrupt) {
        self.lock().push(irq);
    }
}
