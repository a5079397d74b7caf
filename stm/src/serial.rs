// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Serial lock and quiescence
//!
//! One process-wide spin lock coordinates the rare serial paths: thread
//! list changes, timestamp-overflow reinitialization and the hardware
//! fallback. Commits never take it; they use per-thread published snapshot
//! times instead, and [`quiesce`] waits on those.

use crate::descriptor::{registered_threads, SharedState};
use crate::word::{TmWord, INACTIVE};
use lazy_static::lazy_static;
use log::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct SerialLock {
    lock: AtomicBool,
}

impl SerialLock {
    const fn new() -> Self {
        Self {
            lock: AtomicBool::new(false),
        }
    }

    /// Spins on a plain load until the lock looks free, then attempts the
    /// exchange; repeats on a lost race.
    pub fn acquire(&self) {
        loop {
            while self.lock.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }
            if !self.lock.swap(true, Ordering::SeqCst) {
                return;
            }
        }
    }

    pub fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }

    pub fn held(&self) -> bool {
        self.lock.load(Ordering::SeqCst)
    }

    pub fn held_relaxed(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }
}

lazy_static! {
    static ref TM_LOCK: SerialLock = SerialLock::new();
}

pub fn serial_lock() -> &'static SerialLock {
    &TM_LOCK
}

/// Privatization safety: blocks until every other registered thread has
/// published either [`INACTIVE`] or a snapshot time of at least
/// `priv_time`. After that, the committed data may be accessed without
/// instrumentation.
pub fn quiesce(priv_time: TmWord, me: &Arc<SharedState>) {
    for peer in registered_threads() {
        if Arc::ptr_eq(&peer, me) {
            continue;
        }
        loop {
            let snapshot = peer.load(Ordering::Acquire);
            if snapshot == INACTIVE || snapshot >= priv_time {
                break;
            }
            core::hint::spin_loop();
        }
    }
}

/// Blocks until every registered thread other than the caller is inactive.
/// Only meaningful while holding the serial lock, which keeps new threads
/// from registering and restarting threads from beginning.
pub fn wait_for_inactive(me: &Arc<SharedState>) {
    debug_assert!(serial_lock().held());
    for peer in registered_threads() {
        if Arc::ptr_eq(&peer, me) {
            continue;
        }
        while peer.load(Ordering::Acquire) != INACTIVE {
            core::hint::spin_loop();
        }
    }
    debug!("all peer threads quiescent for reinitialization");
}
