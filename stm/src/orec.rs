// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Ownership records
//!
//! An orec is a single atomic word. With the lock bit (MSB) clear, the word
//! is the timestamp of the last committed write to the locations the orec
//! covers. With the lock bit set, the rest of the word identifies the
//! locking thread (its descriptor address shifted right by one).
//!
//! Because the lock bit is the MSB, a locked orec compares greater than any
//! timestamp, so "more recent than my snapshot" and "locked" fall out of a
//! single comparison.

use crate::descriptor::Descriptor;
use crate::word::TmWord;
use std::sync::atomic::{AtomicUsize, Ordering};

/// MSB of the word.
pub const LOCK_BIT: TmWord = !(TmWord::MAX >> 1);

/// Largest valid timestamp: all bits except the lock bit and the overflow
/// reserve bit.
pub const TIME_MAX: TmWord = TmWord::MAX >> 2;

/// With the reserve bit spare, `TIME_MAX + 1` pending increments can be in
/// flight before the timestamp space is truly exhausted.
pub const OVERFLOW_RESERVE: TmWord = TIME_MAX + 1;

/// Number of ownership records; locations map onto these in 16-byte stripes.
pub const ORE_COUNT: usize = 1 << 19;

/// log2 of the stripe size.
pub const STRIPE_SHIFT: usize = 4;

/// Bytes covered by one orec before the mapping moves to the next index.
pub const STRIPE_SIZE: usize = 1 << STRIPE_SHIFT;

pub fn is_locked(o: TmWord) -> bool {
    o & LOCK_BIT != 0
}

/// The word a thread stores into every orec it acquires.
pub fn locked_by(tx: &Descriptor) -> TmWord {
    ((tx as *const Descriptor as usize) >> 1) | LOCK_BIT
}

pub fn is_more_recent_or_locked(o: TmWord, than_time: TmWord) -> bool {
    o > than_time
}

/// Maps an address to its orec index.
pub fn orec_index(addr: usize) -> usize {
    (addr >> STRIPE_SHIFT) & (ORE_COUNT - 1)
}

pub fn next_orec(orec: usize) -> usize {
    (orec + 1) & (ORE_COUNT - 1)
}

/// Index one past the last orec covering `[addr, addr + len)`, modulo the
/// table size.
pub fn orec_range_end(addr: usize, len: usize) -> usize {
    ((addr + len + STRIPE_SIZE - 1) >> STRIPE_SHIFT) & (ORE_COUNT - 1)
}

/// The flat table of ownership records.
pub struct OrecTable {
    orecs: Vec<AtomicUsize>,
}

impl OrecTable {
    /// Allocates the zeroed table; timestamps start at zero.
    pub fn new() -> Self {
        let mut orecs = Vec::with_capacity(ORE_COUNT);
        orecs.resize_with(ORE_COUNT, || AtomicUsize::new(0));
        Self { orecs }
    }

    pub fn load(&self, idx: usize, order: Ordering) -> TmWord {
        self.orecs[idx].load(order)
    }

    pub fn store(&self, idx: usize, value: TmWord, order: Ordering) {
        self.orecs[idx].store(value, order);
    }

    pub fn compare_exchange(
        &self,
        idx: usize,
        current: TmWord,
        new: TmWord,
        order: Ordering,
    ) -> Result<TmWord, TmWord> {
        self.orecs[idx].compare_exchange(current, new, order, Ordering::Relaxed)
    }

    /// Clears every record. Only called while holding the serial lock with
    /// all other threads quiescent, so relaxed stores suffice.
    pub fn reinit(&self) {
        for orec in &self.orecs {
            orec.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for OrecTable {
    fn default() -> Self {
        Self::new()
    }
}
