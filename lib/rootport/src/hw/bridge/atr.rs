// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AXI-to-PCIe address translation (ATR) table.
//!
//! Each slot maps a power-of-two window of the local bus onto the PCIe
//! side. The SRCADDR_PARAM register of a slot packs the low source address
//! bits together with the window size, encoded as `log2(size) - 1`, and an
//! enable bit:
//!
//! ```text
//!  31                12 11     7 6       1   0
//! +--------------------+--------+---------+---+
//! |  source[31:12]     |  rsvd  | log2-1  | E |
//! +--------------------+--------+---------+---+
//! ```

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::Arc;

use super::bits;
use crate::common::{AddressRange, KB};
use crate::mmio::RegisterBlock;
use crate::util::bits::exact_log2;

use thiserror::Error;

/// Most ATR slots the bridge implements.
pub const MAX_SLOTS: usize = 8;
/// Smallest window the size field can describe.
pub const MIN_WINDOW_SIZE: u64 = 4 * KB;

#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum AtrError {
    /// Zero, not a power of two, or below the 4KiB minimum
    #[error("window size {size:#x} is not a power of two of at least 4KiB")]
    InvalidWindowSize { size: u64 },

    #[error("slot {slot} does not exist (table has {count} slots)")]
    InvalidSlot { slot: usize, count: usize },

    #[error("slot count {0} is outside 1..={MAX_SLOTS}")]
    InvalidSlotCount(usize),

    /// The low 12 bits of the source register hold the size and enable
    #[error("source base {base:#x} is not 4KiB aligned")]
    MisalignedBase { base: u64 },

    #[error("window for slot {slot} overlaps the window in slot {other}")]
    WindowOverlap { slot: usize, other: usize },
}

/// Interface the translated transactions are routed to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegionKind {
    /// PCIe configuration requests (the ECAM window)
    ConfigSpace,
    /// Memory and I/O transactions
    TxRx,
}

impl RegionKind {
    const fn trsl_id(self) -> u32 {
        match self {
            RegionKind::ConfigSpace => bits::TRSL_ID_CONFIG,
            RegionKind::TxRx => bits::TRSL_ID_TXRX,
        }
    }
}

impl Display for RegionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RegionKind::ConfigSpace => write!(f, "config"),
            RegionKind::TxRx => write!(f, "txrx"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TranslationRegion {
    pub slot_index: usize,
    pub source_base: u64,
    pub source_size: u64,
    pub dest_base: u64,
    pub kind: RegionKind,
    pub enabled: bool,
}

impl TranslationRegion {
    pub fn source(&self) -> AddressRange {
        AddressRange::new(self.source_base, self.source_size)
    }

    /// Value of the slot's SRCADDR_PARAM register for this region.
    pub fn src_param(&self) -> u32 {
        // The size was validated when the region was programmed
        let size = exact_log2(self.source_size).unwrap_or(1) - 1;
        let enable = if self.enabled { bits::ATR_ENABLE } else { 0 };
        (self.source_base as u32 & bits::ATR_SRC_ADDR_LO_MASK)
            | size << bits::ATR_SIZE_SHIFT
            | enable
    }
}

impl Display for TranslationRegion {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(
            f,
            "atr{} {} {} -> {:#x}{}",
            self.slot_index,
            self.kind,
            self.source(),
            self.dest_base,
            if self.enabled { "" } else { " (disabled)" }
        )
    }
}

/// Encode a window size as the `log2(size) - 1` field of SRCADDR_PARAM.
pub fn encode_size(size: u64) -> Result<u32, AtrError> {
    match exact_log2(size) {
        Some(log2) if size >= MIN_WINDOW_SIZE => Ok(log2 - 1),
        _ => Err(AtrError::InvalidWindowSize { size }),
    }
}

/// Smallest window size the table accepts which covers `size` bytes.
pub fn enclosing_window_size(size: u64) -> Option<u64> {
    if size == 0 {
        return None;
    }
    size.checked_next_power_of_two().map(|s| s.max(MIN_WINDOW_SIZE))
}

/// The bridge's table of translation slots.
///
/// Programming happens during single-threaded bring-up; afterwards the
/// table is only read.
pub struct AddressTranslationTable {
    regs: Arc<dyn RegisterBlock>,
    slots: Vec<Option<TranslationRegion>>,
}

impl AddressTranslationTable {
    pub fn new(
        regs: Arc<dyn RegisterBlock>,
        slot_count: usize,
    ) -> Result<Self, AtrError> {
        if slot_count == 0 || slot_count > MAX_SLOTS {
            return Err(AtrError::InvalidSlotCount(slot_count));
        }
        Ok(Self { regs, slots: vec![None; slot_count] })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn check_slot(&self, slot: usize) -> Result<(), AtrError> {
        if slot < self.slots.len() {
            Ok(())
        } else {
            Err(AtrError::InvalidSlot { slot, count: self.slots.len() })
        }
    }

    fn reg(slot: usize, off: usize) -> usize {
        bits::BRIDGE_ATR0_BASE + slot * bits::ATR_STRIDE + off
    }

    /// Program `slot` to translate `source_size` bytes at `source_base` onto
    /// `dest_base`, replacing whatever the slot held before.
    pub fn program(
        &mut self,
        slot: usize,
        source_base: u64,
        source_size: u64,
        dest_base: u64,
        kind: RegionKind,
    ) -> Result<(), AtrError> {
        self.check_slot(slot)?;
        encode_size(source_size)?;
        if source_base % MIN_WINDOW_SIZE != 0 {
            return Err(AtrError::MisalignedBase { base: source_base });
        }

        let source = AddressRange::new(source_base, source_size);
        if let Some(other) = self.enabled_regions().find(|r| {
            r.slot_index != slot && r.source().overlaps(&source)
        }) {
            return Err(AtrError::WindowOverlap {
                slot,
                other: other.slot_index,
            });
        }

        let region = TranslationRegion {
            slot_index: slot,
            source_base,
            source_size,
            dest_base,
            kind,
            enabled: true,
        };
        let write = |off, val| self.regs.write32(Self::reg(slot, off), val);
        write(bits::ATR_SRCADDR_PARAM, region.src_param());
        write(bits::ATR_SRC_ADDR, (source_base >> 32) as u32);
        write(bits::ATR_TRSL_ADDR_LSB, dest_base as u32);
        write(bits::ATR_TRSL_ADDR_UDW, (dest_base >> 32) as u32);
        write(bits::ATR_TRSL_PARAM, kind.trsl_id());

        self.slots[slot] = Some(region);
        Ok(())
    }

    /// Disable `slot`. Disabling a slot which is already off, or was never
    /// programmed, is not an error.
    pub fn unprogram(&mut self, slot: usize) -> Result<(), AtrError> {
        self.check_slot(slot)?;
        let param = Self::reg(slot, bits::ATR_SRCADDR_PARAM);
        let cur = self.regs.read32(param);
        self.regs.write32(param, cur & !bits::ATR_ENABLE);
        if let Some(region) = self.slots[slot].as_mut() {
            region.enabled = false;
        }
        Ok(())
    }

    pub fn region(&self, slot: usize) -> Option<&TranslationRegion> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn enabled_regions(
        &self,
    ) -> impl Iterator<Item = &TranslationRegion> + '_ {
        self.slots.iter().flatten().filter(|r| r.enabled)
    }

    /// First unused or disabled slot at or after `from`.
    pub fn free_slot(&self, from: usize) -> Option<usize> {
        (from..self.slots.len())
            .find(|&i| self.slots[i].map_or(true, |r| !r.enabled))
    }

    /// SRCADDR_PARAM of `slot` as currently held by the hardware.
    pub fn hw_param(&self, slot: usize) -> Result<u32, AtrError> {
        self.check_slot(slot)?;
        Ok(self.regs.read32(Self::reg(slot, bits::ATR_SRCADDR_PARAM)))
    }

    /// Local window through which configuration requests are issued.
    pub fn config_space_window(&self) -> Option<AddressRange> {
        self.enabled_regions()
            .find(|r| r.kind == RegionKind::ConfigSpace)
            .map(TranslationRegion::source)
    }

    /// PCIe address a local access at `addr` is forwarded to.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        self.enabled_regions()
            .filter(|r| r.kind == RegionKind::TxRx)
            .find(|r| r.source().contains(addr))
            .map(|r| r.dest_base.wrapping_add(addr - r.source_base))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::MB;
    use crate::hw::sim::SimRegs;

    use proptest::prelude::*;

    fn table(slots: usize) -> (Arc<SimRegs>, AddressTranslationTable) {
        let regs = Arc::new(SimRegs::new(bits::LEN_BRIDGE));
        let atr = AddressTranslationTable::new(regs.clone(), slots).unwrap();
        (regs, atr)
    }

    fn atr_reg(slot: usize, off: usize) -> usize {
        bits::BRIDGE_ATR0_BASE + slot * bits::ATR_STRIDE + off
    }

    #[test]
    fn size_encoding() {
        assert_eq!(encode_size(4 * KB), Ok(11));
        assert_eq!(encode_size(256 * MB), Ok(27));
        assert_eq!(encode_size(1 << 63), Ok(62));
        for bad in [0, 1, 2048, 0x3000, 64 * MB + 4 * KB] {
            assert_eq!(
                encode_size(bad),
                Err(AtrError::InvalidWindowSize { size: bad })
            );
        }
    }

    #[test]
    fn enclosing_size() {
        assert_eq!(enclosing_window_size(0), None);
        assert_eq!(enclosing_window_size(1), Some(4 * KB));
        assert_eq!(enclosing_window_size(256 * MB), Some(256 * MB));
        assert_eq!(enclosing_window_size(200 * MB), Some(256 * MB));
        assert_eq!(enclosing_window_size(u64::MAX), None);
    }

    #[test]
    fn program_writes_registers() {
        let (regs, mut atr) = table(2);
        atr.program(0, 0x3000_0000, 256 * MB, 0, RegionKind::ConfigSpace)
            .unwrap();
        atr.program(
            1,
            0x1_4000_0000,
            64 * MB,
            0x2_0000_0000,
            RegionKind::TxRx,
        )
        .unwrap();

        assert_eq!(regs.get(atr_reg(0, bits::ATR_SRCADDR_PARAM)), 0x3000_0037);
        assert_eq!(regs.get(atr_reg(0, bits::ATR_TRSL_PARAM)), 1);
        assert_eq!(regs.get(atr_reg(1, bits::ATR_SRCADDR_PARAM)), 0x4000_0033);
        assert_eq!(regs.get(atr_reg(1, bits::ATR_SRC_ADDR)), 0x1);
        assert_eq!(regs.get(atr_reg(1, bits::ATR_TRSL_ADDR_LSB)), 0);
        assert_eq!(regs.get(atr_reg(1, bits::ATR_TRSL_ADDR_UDW)), 0x2);
        assert_eq!(regs.get(atr_reg(1, bits::ATR_TRSL_PARAM)), 0);

        assert_eq!(atr.enabled_regions().count(), 2);
        assert_eq!(
            atr.config_space_window(),
            Some(AddressRange::new(0x3000_0000, 256 * MB))
        );
        assert_eq!(atr.hw_param(1), Ok(0x4000_0033));
    }

    #[test]
    fn rejects_bad_requests() {
        let (regs, mut atr) = table(2);
        assert_eq!(
            atr.program(2, 0, 4 * KB, 0, RegionKind::TxRx),
            Err(AtrError::InvalidSlot { slot: 2, count: 2 })
        );
        assert_eq!(
            atr.program(0, 0x3000_0800, 4 * KB, 0, RegionKind::TxRx),
            Err(AtrError::MisalignedBase { base: 0x3000_0800 })
        );
        assert_eq!(
            atr.program(0, 0x3000_0000, 3 * MB, 0, RegionKind::TxRx),
            Err(AtrError::InvalidWindowSize { size: 3 * MB })
        );
        // Nothing reached the hardware
        assert!(regs.writes().is_empty());

        atr.program(0, 0x4000_0000, 64 * MB, 0, RegionKind::TxRx).unwrap();
        assert_eq!(
            atr.program(1, 0x4200_0000, 4 * KB, 0, RegionKind::TxRx),
            Err(AtrError::WindowOverlap { slot: 1, other: 0 })
        );
        // Reprogramming the same slot replaces its window
        atr.program(0, 0x4200_0000, 4 * KB, 0, RegionKind::TxRx).unwrap();
        assert_eq!(atr.region(0).unwrap().source_base, 0x4200_0000);

        assert!(AddressTranslationTable::new(regs.clone(), 0).is_err());
        assert_eq!(
            AddressTranslationTable::new(regs, MAX_SLOTS + 1).err(),
            Some(AtrError::InvalidSlotCount(MAX_SLOTS + 1))
        );
    }

    #[test]
    fn unprogram_idempotent() {
        let (regs, mut atr) = table(2);
        atr.unprogram(1).unwrap();
        atr.program(1, 0x4000_0000, 64 * MB, 0, RegionKind::TxRx).unwrap();
        assert_eq!(atr.free_slot(0), Some(0));
        assert_eq!(atr.free_slot(1), None);

        atr.unprogram(1).unwrap();
        atr.unprogram(1).unwrap();
        assert_eq!(regs.get(atr_reg(1, bits::ATR_SRCADDR_PARAM)), 0x4000_0032);
        assert_eq!(atr.enabled_regions().count(), 0);
        assert!(!atr.region(1).unwrap().enabled);
        assert_eq!(atr.free_slot(1), Some(1));
        assert_eq!(atr.translate(0x4000_0000), None);
    }

    #[test]
    fn translate_through_txrx() {
        let (_regs, mut atr) = table(3);
        atr.program(0, 0x3000_0000, 256 * MB, 0, RegionKind::ConfigSpace)
            .unwrap();
        atr.program(1, 0x4000_0000, 64 * MB, 0x0, RegionKind::TxRx).unwrap();
        atr.program(2, 0x8000_0000, 4 * KB, 0xe000_0000, RegionKind::TxRx)
            .unwrap();

        assert_eq!(atr.translate(0x4000_1234), Some(0x1234));
        assert_eq!(atr.translate(0x8000_0ffc), Some(0xe000_0ffc));
        assert_eq!(atr.translate(0x8000_1000), None);
        // Config space is not a memory window
        assert_eq!(atr.translate(0x3000_0000), None);
    }

    fn window_size() -> impl Strategy<Value = u64> {
        prop_oneof![any::<u64>(), (0u32..64).prop_map(|shift| 1u64 << shift)]
    }

    proptest! {
        #[test]
        fn program_iff_power_of_two(size in window_size()) {
            let (_regs, mut atr) = table(1);
            let res = atr.program(0, 0, size, 0, RegionKind::TxRx);
            if size.is_power_of_two() && size >= MIN_WINDOW_SIZE {
                prop_assert!(res.is_ok());
                let param = atr.hw_param(0).unwrap();
                let field =
                    (param & bits::ATR_SIZE_MASK) >> bits::ATR_SIZE_SHIFT;
                prop_assert_eq!(1u64 << (field + 1), size);
            } else {
                prop_assert_eq!(
                    res,
                    Err(AtrError::InvalidWindowSize { size })
                );
            }
        }
    }
}
