// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::util::bits::lowest_clear_bit;

use thiserror::Error;

/// Number of MSI vectors the bridge decodes.
pub const MSI_VECTOR_COUNT: u32 = 32;

#[derive(Copy, Clone, Debug, Error, Eq, PartialEq)]
pub enum MsiError {
    #[error("no free MSI vectors")]
    Exhausted,

    /// The vector was not allocated
    #[error("MSI vector {0} freed while not allocated")]
    DoubleFree(MsiVectorId),

    #[error("MSI vector {0} is beyond the allocator's capacity")]
    OutOfRange(MsiVectorId),
}

/// Index of an MSI vector, also used as the message data.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MsiVectorId(u32);

impl MsiVectorId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl Display for MsiVectorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.0)
    }
}

/// Fixed-capacity bitmap of MSI vector ids.
///
/// A bit is set iff the vector is assigned. Allocation always picks the
/// lowest free id. Both operations are lock-free, so device attach paths on
/// different threads may race freely.
pub struct MsiVectorAllocator {
    capacity: u32,
    words: Box<[AtomicU64]>,
}

impl MsiVectorAllocator {
    pub fn new(capacity: u32) -> Self {
        let nwords = ((capacity + u64::BITS - 1) / u64::BITS) as usize;
        let words = (0..nwords).map(|_| AtomicU64::new(0)).collect();
        Self { capacity, words }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of valid ids carried by word `idx`.
    fn word_width(&self, idx: usize) -> u32 {
        (self.capacity - idx as u32 * u64::BITS).min(u64::BITS)
    }

    fn locate(&self, id: MsiVectorId) -> Result<(usize, u64), MsiError> {
        if id.0 >= self.capacity {
            return Err(MsiError::OutOfRange(id));
        }
        Ok(((id.0 / u64::BITS) as usize, 1u64 << (id.0 % u64::BITS)))
    }

    pub fn allocate(&self) -> Result<MsiVectorId, MsiError> {
        for (idx, word) in self.words.iter().enumerate() {
            let width = self.word_width(idx);
            let mut cur = word.load(Ordering::Relaxed);
            while let Some(bit) = lowest_clear_bit(cur, width) {
                match word.compare_exchange_weak(
                    cur,
                    cur | 1 << bit,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        return Ok(MsiVectorId(idx as u32 * u64::BITS + bit))
                    }
                    Err(actual) => cur = actual,
                }
            }
        }
        Err(MsiError::Exhausted)
    }

    pub fn free(&self, id: MsiVectorId) -> Result<(), MsiError> {
        let (idx, mask) = self.locate(id)?;
        let prev = self.words[idx].fetch_and(!mask, Ordering::AcqRel);
        if prev & mask == 0 {
            Err(MsiError::DoubleFree(id))
        } else {
            Ok(())
        }
    }

    pub fn is_allocated(&self, id: MsiVectorId) -> bool {
        match self.locate(id) {
            Ok((idx, mask)) => {
                self.words[idx].load(Ordering::Acquire) & mask != 0
            }
            Err(_) => false,
        }
    }

    pub fn allocated_count(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }
}

impl Default for MsiVectorAllocator {
    fn default() -> Self {
        Self::new(MSI_VECTOR_COUNT)
    }
}
