// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A shared scalar cell addressed through the transactional entry points.
//! This is the safe face the tests and benchmarks program against;
//! instrumented code uses the raw typed entry points directly.

use crate::dispatch::Tx;
use crate::error::TxResult;
use crate::types::TmPrimitive;
use std::cell::UnsafeCell;

pub struct TCell<V> {
    value: UnsafeCell<V>,
}

// Concurrent access goes through the runtime's protocols; the cell itself
// carries no synchronization.
unsafe impl<V: TmPrimitive + Send> Sync for TCell<V> {}
unsafe impl<V: TmPrimitive + Send> Send for TCell<V> {}

impl<V: TmPrimitive> TCell<V> {
    pub fn new(value: V) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Raw address of the cell, for byte-granular operations.
    pub fn addr(&self) -> *mut V {
        self.value.get()
    }

    /// Transactional read.
    pub fn read(&self, tx: &mut Tx) -> TxResult<V> {
        unsafe { tx.load(self.value.get() as *const V) }
    }

    /// Transactional write.
    pub fn write(&self, tx: &mut Tx, value: V) -> TxResult<()> {
        unsafe { tx.store(self.value.get(), value) }
    }

    /// Direct unsynchronized read.
    ///
    /// # Safety
    ///
    /// Only valid while no transaction can be writing the cell, e.g. after
    /// all worker threads are joined or behind a committed quiescent point.
    pub unsafe fn read_direct(&self) -> V {
        self.value.get().read()
    }
}

impl<V: TmPrimitive + Default> Default for TCell<V> {
    fn default() -> Self {
        Self::new(V::default())
    }
}
