// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Thread descriptor
//!
//! One descriptor per application thread, created lazily on the first
//! transactional operation and torn down at thread exit. The descriptor is
//! owned by its thread; the only part other threads ever look at is the
//! [`SharedState`] slot it publishes through the process-wide registry,
//! which carries the thread's current snapshot time for quiescence.

use crate::error::RestartReason;
use crate::redolog::RedoLog;
use crate::valuelog::ValueLog;
use crate::word::{TmWord, INACTIVE};
use lazy_static::lazy_static;
use log::*;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Process-unique transaction ids are handed out in blocks of this size so
/// that consecutive transactions on one thread stay off the shared counter.
const TID_BLOCK_SIZE: u64 = 1 << 16;

static GLOBAL_TID: AtomicU64 = AtomicU64::new(TID_BLOCK_SIZE);

/// The part of a thread's state other threads may read: its published
/// snapshot time, or [`INACTIVE`] when no transaction is running.
pub struct SharedState {
    snapshot: AtomicUsize,
}

impl SharedState {
    pub(crate) fn new() -> Self {
        Self {
            snapshot: AtomicUsize::new(INACTIVE),
        }
    }

    pub fn publish(&self, time: TmWord, order: Ordering) {
        self.snapshot.store(time, order);
    }

    pub fn load(&self, order: Ordering) -> TmWord {
        self.snapshot.load(order)
    }
}

/// One read-log or write-log record: which orec, and the word observed when
/// the entry was pushed.
#[derive(Clone, Copy)]
pub struct OrecEntry {
    pub orec: usize,
    pub value: TmWord,
}

pub type CommitAction = Box<dyn FnOnce()>;

pub struct Descriptor {
    /// Flat nesting depth; a transaction begins on 0 -> 1 and commits on
    /// 1 -> 0.
    pub nesting: u32,

    /// Instrumentation property word of the current (outermost) begin.
    pub prop: u32,

    /// Registry slot; written only by this thread.
    pub shared: Arc<SharedState>,

    /// Orecs observed by reads, in read order.
    pub readlog: Vec<OrecEntry>,

    /// Orecs acquired for writing, with their pre-acquisition words.
    pub writelog: Vec<OrecEntry>,

    /// Buffered writes.
    pub redolog: RedoLog,

    /// Observed read bytes (value-based validation only).
    pub valuelog: ValueLog,

    /// Upper edge of the transactional activation records.
    pub stack_top: usize,

    /// Most recent lower edge seen by a transactional access.
    pub stack_bottom: usize,

    /// Restart counters by reason.
    pub restart_counts: [u64; RestartReason::COUNT],

    /// Id of the current transaction.
    pub id: u64,

    local_tid: u64,

    /// Actions to run once, in FIFO order, after the outermost commit.
    pub commit_actions: Vec<CommitAction>,
}

impl Descriptor {
    pub(crate) fn new(shared: Arc<SharedState>) -> Self {
        Self {
            nesting: 0,
            prop: 0,
            shared,
            readlog: Vec::new(),
            writelog: Vec::new(),
            redolog: RedoLog::new(),
            valuelog: ValueLog::new(),
            stack_top: 0,
            stack_bottom: 0,
            restart_counts: [0; RestartReason::COUNT],
            id: 0,
            local_tid: 0,
            commit_actions: Vec::new(),
        }
    }

    /// Assigns the next transaction id, fetching a fresh block from the
    /// shared counter only when the local block is exhausted.
    pub fn next_tid(&mut self) {
        if self.local_tid & (TID_BLOCK_SIZE - 1) != 0 {
            self.id = self.local_tid;
            self.local_tid += 1;
        } else {
            self.id = GLOBAL_TID.fetch_add(TID_BLOCK_SIZE, Ordering::Relaxed);
            self.local_tid = self.id + 1;
        }
    }

    pub fn count_restart(&mut self, reason: RestartReason) {
        self.restart_counts[reason.index()] += 1;
    }

    pub fn clear_logs(&mut self) {
        self.readlog.clear();
        self.writelog.clear();
        self.redolog.reset();
        self.valuelog.clear();
    }

    /// True iff `[addr, addr + len)` belongs to this thread's transactional
    /// stack frames, given the current lower edge. Accesses that cross the
    /// lower edge count as stack accesses and stay unlogged.
    pub fn in_stack_frame(&self, addr: usize, len: usize, bottom: usize) -> bool {
        (addr <= self.stack_top && addr > bottom) || (addr < bottom && addr + len > bottom)
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<Vec<Arc<SharedState>>> = Mutex::new(Vec::new());
}

/// Snapshot of every live thread's shared slot, for quiescence sweeps.
pub fn registered_threads() -> Vec<Arc<SharedState>> {
    REGISTRY.lock().expect("thread registry poisoned").clone()
}

pub fn thread_count() -> usize {
    REGISTRY.lock().expect("thread registry poisoned").len()
}

fn register(shared: Arc<SharedState>) {
    crate::serial::serial_lock().acquire();
    {
        let mut registry = REGISTRY.lock().expect("thread registry poisoned");
        registry.push(shared);
        let n = registry.len();
        if !crate::dispatch::algorithm_supports(n) {
            error!("thread limit exceeded for the selected algorithm ({} threads)", n);
            crate::serial::serial_lock().release();
            std::process::abort();
        }
        trace!("registered transactional thread #{}", n);
    }
    crate::serial::serial_lock().release();
}

fn deregister(shared: &Arc<SharedState>) {
    crate::serial::serial_lock().acquire();
    {
        let mut registry = REGISTRY.lock().expect("thread registry poisoned");
        registry.retain(|s| !Arc::ptr_eq(s, shared));
        trace!("deregistered transactional thread ({} remain)", registry.len());
    }
    crate::serial::serial_lock().release();
}

struct DescSlot {
    ptr: Cell<*mut Descriptor>,
}

impl Drop for DescSlot {
    fn drop(&mut self) {
        let ptr = self.ptr.get();
        if ptr.is_null() {
            return;
        }
        let desc = unsafe { Box::from_raw(ptr) };
        assert_eq!(desc.nesting, 0, "thread exit while a transaction is still active");
        desc.shared.publish(INACTIVE, Ordering::Release);
        deregister(&desc.shared);
    }
}

thread_local! {
    static DESC: DescSlot = DescSlot {
        ptr: Cell::new(std::ptr::null_mut()),
    };
}

/// Runs `f` with the calling thread's descriptor, creating and registering
/// it on first use.
///
/// Entry points must not nest calls to this; each public operation takes the
/// descriptor exactly once.
pub(crate) fn with_descriptor<R>(f: impl FnOnce(&mut Descriptor) -> R) -> R {
    DESC.with(|slot| {
        let mut ptr = slot.ptr.get();
        if ptr.is_null() {
            let shared = Arc::new(SharedState::new());
            register(shared.clone());
            ptr = Box::into_raw(Box::new(Descriptor::new(shared)));
            slot.ptr.set(ptr);
        }
        f(unsafe { &mut *ptr })
    })
}

/// Like [`with_descriptor`], but passes `None` instead of creating a
/// descriptor for a thread that never ran a transaction.
pub(crate) fn try_with_descriptor<R>(f: impl FnOnce(Option<&mut Descriptor>) -> R) -> R {
    DESC.with(|slot| {
        let ptr = slot.ptr.get();
        if ptr.is_null() {
            f(None)
        } else {
            f(Some(unsafe { &mut *ptr }))
        }
    })
}
