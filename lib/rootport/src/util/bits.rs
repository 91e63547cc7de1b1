// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bit-scan helpers over fixed-width words.

/// Index of the lowest set bit in `val`.
pub const fn lowest_set_bit(val: u64) -> Option<u32> {
    if val == 0 {
        None
    } else {
        Some(val.trailing_zeros())
    }
}

/// Index of the lowest clear bit among the low `width` bits of `val`.
pub const fn lowest_clear_bit(val: u64, width: u32) -> Option<u32> {
    lowest_set_bit(!val & low_mask(width))
}

/// Mask covering the low `width` bits.
pub const fn low_mask(width: u32) -> u64 {
    if width >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Base-2 logarithm of `val` if it is an exact power of two.
pub const fn exact_log2(val: u64) -> Option<u32> {
    if val.is_power_of_two() {
        Some(val.trailing_zeros())
    } else {
        None
    }
}

/// Iterator over the indices of set bits, lowest first.
#[derive(Copy, Clone, Debug)]
pub struct SetBits(u64);

impl SetBits {
    pub const fn new(val: u64) -> Self {
        Self(val)
    }
}

impl Iterator for SetBits {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let bit = lowest_set_bit(self.0)?;
        // Drop the lowest set bit
        self.0 &= self.0 - 1;
        Some(bit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}
impl ExactSizeIterator for SetBits {}
