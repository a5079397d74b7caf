// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional condition variables
//!
//! Condition synchronization that is safe to use from inside an atomic
//! region. Every thread owns one queue node with a private counting
//! semaphore; a condvar is a doubly-linked queue of such nodes, oldest at
//! the head.
//!
//! The trick is the split between the queue operation and the blocking
//! operation. `wait` enqueues the caller's node *inside* the enclosing
//! transaction and defers the semaphore wait to an on-commit action, so by
//! the time the thread can block, its enqueue is already visible: a
//! concurrent signaler either finds the node and posts it, or linearizes
//! before the enqueue and wakes someone else. Semaphores count, so a post
//! that lands before the wait is consumed immediately and no wakeup is
//! lost.
//!
//! A `wait` must be the last shared-memory operation of its atomic region;
//! control flow that would continue "after" the wait belongs in a
//! subsequent region, steered by a captured local. See the bounded-buffer
//! test for the pattern.

mod semaphore;

pub use semaphore::Semaphore;

use log::*;
use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Mutex, MutexGuard};
use tmkit_stm::{Tx, TxResult};

#[cfg(feature = "stats")]
use std::sync::atomic::AtomicU64;

/// Per-thread wait/wake counters, kept on the thread's queue node.
#[cfg(feature = "stats")]
#[derive(Default)]
pub struct Stats {
    pub waits: AtomicU64,
    pub signals: AtomicU64,
    pub broadcasts: AtomicU64,
    pub wakeups: AtomicU64,
    pub empties: AtomicU64,
}

/// One thread's entry in condvar queues: a semaphore plus queue links. The
/// node is created on first use and leaked, so a signaler holding a raw
/// pointer to it can never observe a dangling semaphore.
pub struct CvNode {
    sem: Semaphore,
    next: UnsafeCell<*mut CvNode>,
    prev: UnsafeCell<*mut CvNode>,

    #[cfg(feature = "stats")]
    stats: Stats,
}

// Nodes are shared through condvar queues; all cross-thread access runs
// either inside transactions or through the semaphore.
unsafe impl Send for CvNode {}
unsafe impl Sync for CvNode {}

impl CvNode {
    fn new() -> Self {
        Self {
            sem: Semaphore::new(),
            next: UnsafeCell::new(ptr::null_mut()),
            prev: UnsafeCell::new(ptr::null_mut()),

            #[cfg(feature = "stats")]
            stats: Stats::default(),
        }
    }

    fn note_wait(&self) {
        #[cfg(feature = "stats")]
        self.stats.waits.fetch_add(1, Ordering::Relaxed);
    }

    fn note_signal(&self) {
        #[cfg(feature = "stats")]
        self.stats.signals.fetch_add(1, Ordering::Relaxed);
    }

    fn note_broadcast(&self) {
        #[cfg(feature = "stats")]
        self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
    }

    fn note_wakeup(&self) {
        #[cfg(feature = "stats")]
        self.stats.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    fn note_empty(&self) {
        #[cfg(feature = "stats")]
        self.stats.empties.fetch_add(1, Ordering::Relaxed);
    }
}

thread_local! {
    static MY_NODE: Cell<*mut CvNode> = const { Cell::new(ptr::null_mut()) };
}

fn my_node() -> *mut CvNode {
    MY_NODE.with(|slot| {
        let mut node = slot.get();
        if node.is_null() {
            node = Box::into_raw(Box::new(CvNode::new()));
            slot.set(node);
            trace!("condvar node created for this thread");
        }
        node
    })
}

/// Creates the calling thread's queue node eagerly. Optional; every
/// operation creates it on demand.
pub fn thread_init() {
    my_node();
}

/// The calling thread's counters.
#[cfg(feature = "stats")]
pub fn thread_stats() -> &'static Stats {
    unsafe { &(*my_node()).stats }
}

/// A condition variable for atomic regions: a doubly-linked FIFO queue of
/// per-thread semaphore nodes. A node is in at most one queue at a time.
///
/// A given condvar is driven either transactionally (`wait`/`signal`/
/// `broadcast`) or under an external mutex (the `_lock` variants), never
/// both at once.
pub struct TmCondvar {
    head: UnsafeCell<*mut CvNode>,
    tail: UnsafeCell<*mut CvNode>,
}

unsafe impl Send for TmCondvar {}
unsafe impl Sync for TmCondvar {}

impl Default for TmCondvar {
    fn default() -> Self {
        Self::new()
    }
}

/// Address of a node's `next` link, for transactional access.
fn next_addr(node: *mut CvNode) -> *mut usize {
    unsafe { (*node).next.get() as *mut usize }
}

/// Address of a node's `prev` link, for transactional access.
fn prev_addr(node: *mut CvNode) -> *mut usize {
    unsafe { (*node).prev.get() as *mut usize }
}

impl TmCondvar {
    pub fn new() -> Self {
        Self {
            head: UnsafeCell::new(ptr::null_mut()),
            tail: UnsafeCell::new(ptr::null_mut()),
        }
    }

    fn head_addr(&self) -> *mut usize {
        self.head.get() as *mut usize
    }

    fn tail_addr(&self) -> *mut usize {
        self.tail.get() as *mut usize
    }

    /// Enqueues the calling thread at the tail and arranges for it to
    /// block on its semaphore right after the enclosing region commits.
    ///
    /// Must be the last shared-memory operation of the region: the commit
    /// finalizes the enqueue and then parks the thread, so anything after
    /// the wait would run before the thread actually sleeps.
    pub fn wait(&self, tx: &mut Tx) -> TxResult<()> {
        let me = my_node();
        unsafe {
            // The node is ours alone until the enqueue commits.
            *(*me).next.get() = ptr::null_mut();
            *(*me).prev.get() = ptr::null_mut();

            let tail = tx.load::<usize>(self.tail_addr())?;
            if tail == 0 {
                tx.store(self.head_addr(), me as usize)?;
                tx.store(self.tail_addr(), me as usize)?;
            } else {
                tx.store(prev_addr(me), tail)?;
                tx.store(next_addr(tail as *mut CvNode), me as usize)?;
                tx.store(self.tail_addr(), me as usize)?;
            }

            (*me).note_wait();
            let sem: &'static Semaphore = &(*me).sem;
            tx.on_commit(move || sem.wait());
        }
        Ok(())
    }

    /// Dequeues the oldest waiter, if any, and arranges for its semaphore
    /// to be posted after commit.
    pub fn signal(&self, tx: &mut Tx) -> TxResult<()> {
        unsafe {
            let head = tx.load::<usize>(self.head_addr())?;
            if head == 0 {
                return Ok(());
            }

            let tail = tx.load::<usize>(self.tail_addr())?;
            if head == tail {
                tx.store(self.head_addr(), 0)?;
                tx.store(self.tail_addr(), 0)?;
            } else {
                let next = tx.load::<usize>(next_addr(head as *mut CvNode))?;
                tx.store(self.head_addr(), next)?;
                tx.store(prev_addr(next as *mut CvNode), 0)?;
            }

            (*my_node()).note_signal();
            let sem: &'static Semaphore = &(*(head as *mut CvNode)).sem;
            tx.on_commit(move || sem.post());
        }
        Ok(())
    }

    /// Like [`TmCondvar::signal`], but wakes the newest waiter instead.
    pub fn signal_back(&self, tx: &mut Tx) -> TxResult<()> {
        unsafe {
            let tail = tx.load::<usize>(self.tail_addr())?;
            if tail == 0 {
                return Ok(());
            }

            let head = tx.load::<usize>(self.head_addr())?;
            if head == tail {
                tx.store(self.head_addr(), 0)?;
                tx.store(self.tail_addr(), 0)?;
            } else {
                let prev = tx.load::<usize>(prev_addr(tail as *mut CvNode))?;
                tx.store(self.tail_addr(), prev)?;
                tx.store(next_addr(prev as *mut CvNode), 0)?;
            }

            (*my_node()).note_signal();
            let sem: &'static Semaphore = &(*(tail as *mut CvNode)).sem;
            tx.on_commit(move || sem.post());
        }
        Ok(())
    }

    /// Severs the whole queue and arranges for every severed node to be
    /// posted, oldest first, after commit. Enqueues are transactional, so
    /// a waiter serializes either before the severing (and is woken) or
    /// after it (and joins the fresh queue); nothing is left behind.
    pub fn broadcast(&self, tx: &mut Tx) -> TxResult<()> {
        unsafe {
            let head = tx.load::<usize>(self.head_addr())?;
            if head == 0 {
                (*my_node()).note_empty();
                return Ok(());
            }

            tx.store(self.head_addr(), 0)?;
            tx.store(self.tail_addr(), 0)?;

            (*my_node()).note_broadcast();
            let list = head as *mut CvNode;
            tx.on_commit(move || broadcast_iterate(list));
        }
        Ok(())
    }

    /// Lock-mode wait: enqueues under the caller's mutex, releases it,
    /// sleeps, and reacquires it before returning.
    pub fn wait_lock<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        mutex: &'a Mutex<T>,
    ) -> MutexGuard<'a, T> {
        let me = my_node();
        unsafe {
            *(*me).next.get() = ptr::null_mut();
            *(*me).prev.get() = ptr::null_mut();

            let tail = *self.tail.get();
            if tail.is_null() {
                *self.head.get() = me;
                *self.tail.get() = me;
            } else {
                *(*me).prev.get() = tail;
                *(*tail).next.get() = me;
                *self.tail.get() = me;
            }

            drop(guard);
            (*me).sem.wait();
            (*me).note_wait();
        }
        mutex.lock().expect("condvar mutex poisoned")
    }

    /// Lock-mode signal; `_guard` witnesses that the caller holds the
    /// mutex all users of this condvar lock.
    pub fn signal_lock<T>(&self, _guard: &MutexGuard<'_, T>) {
        unsafe {
            let head = *self.head.get();
            if head.is_null() {
                return;
            }

            if head == *self.tail.get() {
                *self.head.get() = ptr::null_mut();
                *self.tail.get() = ptr::null_mut();
            } else {
                let next = *(*head).next.get();
                *self.head.get() = next;
                *(*next).prev.get() = ptr::null_mut();
            }

            (*my_node()).note_signal();
            (*head).sem.post();
        }
    }

    /// Lock-mode signal from the back of the queue.
    pub fn signal_back_lock<T>(&self, _guard: &MutexGuard<'_, T>) {
        unsafe {
            let tail = *self.tail.get();
            if tail.is_null() {
                return;
            }

            if tail == *self.head.get() {
                *self.head.get() = ptr::null_mut();
                *self.tail.get() = ptr::null_mut();
            } else {
                let prev = *(*tail).prev.get();
                *self.tail.get() = prev;
                *(*prev).next.get() = ptr::null_mut();
            }

            (*my_node()).note_signal();
            (*tail).sem.post();
        }
    }

    /// Lock-mode broadcast: severs and wakes everyone while holding the
    /// mutex.
    pub fn broadcast_lock<T>(&self, _guard: &MutexGuard<'_, T>) {
        unsafe {
            let head = *self.head.get();
            if head.is_null() {
                (*my_node()).note_empty();
                return;
            }

            *self.head.get() = ptr::null_mut();
            *self.tail.get() = ptr::null_mut();

            (*my_node()).note_broadcast();
            broadcast_iterate(head);
        }
    }
}

/// Walks a severed queue and posts every semaphore, oldest first. Each
/// node's `next` is read before its owner is woken; a woken owner may
/// immediately reuse the node on another queue.
fn broadcast_iterate(mut head: *mut CvNode) {
    unsafe {
        while !head.is_null() {
            let node = head;
            head = *(*node).next.get();

            fence(Ordering::SeqCst);

            (*node).sem.post();
            (*my_node()).note_wakeup();
        }
    }
}
