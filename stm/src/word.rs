// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The runtime's machine word and the cache-line padding wrapper used for
//! hot shared counters.

use std::ops::{Deref, DerefMut};

/// All runtime metadata (timestamps, ownership records, the sequence lock)
/// lives in pointer-sized words.
pub type TmWord = usize;

/// Sentinel published in a thread's `shared_state` while it has no
/// transaction running. Compares greater than every valid timestamp, which
/// is what the quiescence loop relies on.
pub const INACTIVE: TmWord = TmWord::MAX;

/// Wraps a value so it occupies its own cache line. The global time base and
/// the sequence lock sit next to unrelated data otherwise, and every commit
/// would drag that data across cores.
#[repr(align(64))]
#[derive(Default, Debug)]
pub struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
    pub const fn new(value: T) -> Self {
        Self(value)
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
