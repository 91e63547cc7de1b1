// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to memory-mapped register blocks.

use std::ptr::NonNull;

/// A block of 32-bit little-endian device registers.
///
/// Offsets are byte offsets from the start of the block. Narrow accessors
/// are provided in terms of aligned 32-bit transfers so that simple
/// backends only need to implement `read32`/`write32`; backends able to
/// issue native narrow transfers may override them.
pub trait RegisterBlock: Send + Sync {
    /// Length of the block in bytes.
    fn len(&self) -> usize;

    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, val: u32);

    fn read16(&self, offset: usize) -> u16 {
        debug_assert_eq!(offset & 1, 0);
        let shift = (offset & 0x3) * 8;
        (self.read32(offset & !0x3) >> shift) as u16
    }
    fn read8(&self, offset: usize) -> u8 {
        let shift = (offset & 0x3) * 8;
        (self.read32(offset & !0x3) >> shift) as u8
    }
    fn write16(&self, offset: usize, val: u16) {
        debug_assert_eq!(offset & 1, 0);
        let shift = (offset & 0x3) * 8;
        let cur = self.read32(offset & !0x3) & !(0xffff << shift);
        self.write32(offset & !0x3, cur | (val as u32) << shift);
    }
    fn write8(&self, offset: usize, val: u8) {
        let shift = (offset & 0x3) * 8;
        let cur = self.read32(offset & !0x3) & !(0xff << shift);
        self.write32(offset & !0x3, cur | (val as u32) << shift);
    }

    /// Read-modify-write helper which sets `bits` in the register at `offset`.
    fn set_bits32(&self, offset: usize, bits: u32) {
        let cur = self.read32(offset);
        self.write32(offset, cur | bits);
    }
}

/// A register block backed by a live memory mapping.
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: Register accesses are single volatile transfers; the mapping is
// owned by whoever constructed the region and outlives it.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Wrap an existing device mapping.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `len` bytes of device
    /// memory, aligned to 4 bytes, which stays valid for the lifetime of the
    /// returned region.
    pub unsafe fn new(base: *mut u8, len: usize) -> Option<Self> {
        let base = NonNull::new(base)?;
        if base.as_ptr() as usize & 0x3 != 0 {
            return None;
        }
        Some(Self { base, len })
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        assert!(offset + std::mem::size_of::<T>() <= self.len);
        assert_eq!(offset % std::mem::size_of::<T>(), 0);
        // SAFETY: bounds and alignment checked above against the mapping
        // handed to `new`.
        unsafe { self.base.as_ptr().add(offset).cast() }
    }
}

impl RegisterBlock for MmioRegion {
    fn len(&self) -> usize {
        self.len
    }
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `ptr` returns an in-bounds, aligned device address.
        u32::from_le(unsafe { self.ptr::<u32>(offset).read_volatile() })
    }
    fn write32(&self, offset: usize, val: u32) {
        // SAFETY: `ptr` returns an in-bounds, aligned device address.
        unsafe { self.ptr::<u32>(offset).write_volatile(val.to_le()) }
    }
    fn read16(&self, offset: usize) -> u16 {
        // SAFETY: `ptr` returns an in-bounds, aligned device address.
        u16::from_le(unsafe { self.ptr::<u16>(offset).read_volatile() })
    }
    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: `ptr` returns an in-bounds device address.
        unsafe { self.ptr::<u8>(offset).read_volatile() }
    }
    fn write16(&self, offset: usize, val: u16) {
        // SAFETY: `ptr` returns an in-bounds, aligned device address.
        unsafe { self.ptr::<u16>(offset).write_volatile(val.to_le()) }
    }
    fn write8(&self, offset: usize, val: u8) {
        // SAFETY: `ptr` returns an in-bounds device address.
        unsafe { self.ptr::<u8>(offset).write_volatile(val) }
    }
}
