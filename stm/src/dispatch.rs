// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Dispatch and public ABI
//!
//! The entry points instrumented code (and the [`Runtime::atomic`] driver)
//! calls into: begin/commit, the typed load/store family, the bulk byte
//! operations, user commit actions and the stack-range filter. Every entry
//! point routes to the process-wide algorithm selected at startup.

use crate::alg::{htm, lazy, norec, Algorithm};
use crate::breaker::BusyBreaker;
use crate::descriptor::{try_with_descriptor, with_descriptor, CommitAction, Descriptor};
use crate::error::{RestartReason, TxError, TxResult};
use crate::serial::{quiesce, serial_lock, wait_for_inactive};
use crate::types::TmPrimitive;
use crate::word::INACTIVE;
use log::*;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// Advisory access modifier carried by the typed entry points. The
/// algorithms here consult the redo log on every load regardless, so the
/// hint never changes behavior, only gives instrumenting compilers a place
/// to put what they know.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessHint {
    /// Read after read.
    RaR,
    /// Read after write.
    RaW,
    /// Read for write.
    RfW,
    /// Write after read.
    WaR,
    /// Write after write.
    WaW,
    /// Write for write.
    WfW,
}

/// What the caller should execute after a successful begin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePath {
    /// Run the instrumented path; every shared access goes through the
    /// typed entry points.
    Instrumented,

    /// Direct accesses are safe: the thread is inside a hardware
    /// transaction or holds the serial lock.
    Uninstrumented,
}

const ALG_UNSET: u8 = 0;

static SELECTED: AtomicU8 = AtomicU8::new(ALG_UNSET);

fn encode(alg: Algorithm) -> u8 {
    match alg {
        Algorithm::MlLazy => 1,
        Algorithm::Norec => 2,
        Algorithm::TsxHybrid => 3,
    }
}

fn decode(v: u8) -> Algorithm {
    match v {
        1 => Algorithm::MlLazy,
        2 => Algorithm::Norec,
        3 => Algorithm::TsxHybrid,
        _ => unreachable!("algorithm read before selection"),
    }
}

/// Process-wide runtime configuration and the transaction driver.
pub struct Runtime;

impl Runtime {
    /// Fixes the algorithm for this process. Must happen before the first
    /// transaction; re-selecting the same algorithm is a no-op, switching
    /// is refused.
    pub fn select(alg: Algorithm) -> TxResult<()> {
        match SELECTED.compare_exchange(ALG_UNSET, encode(alg), Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                info!("transaction runtime selected: {:?}", alg);
                Ok(())
            }
            Err(current) if current == encode(alg) => Ok(()),
            Err(_) => Err(TxError::AlreadySelected),
        }
    }

    /// The active algorithm; locks in the default on first use.
    pub fn current() -> Algorithm {
        let v = SELECTED.load(Ordering::SeqCst);
        if v == ALG_UNSET {
            let _ = Self::select(Algorithm::MlLazy);
            return decode(SELECTED.load(Ordering::SeqCst));
        }
        decode(v)
    }

    /// Runs `f` as an atomic region, retrying on conflict until it
    /// commits, and returns its result.
    ///
    /// Transactional work inside `f` must go through the [`Tx`] handle and
    /// propagate failures with `?`; the driver rolls the attempt back and
    /// re-executes. Nested `atomic` calls are refused at runtime: inner
    /// regions compose by passing `&mut Tx` down, which flattens them into
    /// the outermost one.
    pub fn atomic<R>(mut f: impl FnMut(&mut Tx) -> TxResult<R>) -> R {
        assert!(
            !in_transaction(),
            "nested atomic regions must compose through the enclosing Tx"
        );

        let breaker = BusyBreaker::default();
        // This frame encloses every frame the region body creates, so its
        // marker is the top of the transactional stack range.
        let top_marker = 0u8;
        let stack_top = &top_marker as *const u8 as usize;
        loop {
            let _path = begin_transaction(0);
            with_descriptor(|tx| tx.stack_top = stack_top);
            let mut tx = Tx {
                _not_send: PhantomData,
            };
            let attempt = f(&mut tx).and_then(|r| commit_transaction().map(|_| r));
            match attempt {
                Ok(r) => return r,
                Err(TxError::Restart(reason)) => {
                    if Runtime::current() == Algorithm::TsxHybrid {
                        // Hardware aborts never surface here and the serial
                        // path cannot abort; a request to restart is a
                        // program error.
                        error!("restart requested under the hybrid method: {:?}", reason);
                        std::process::abort();
                    }
                    debug!("transaction restart: {:?}", reason);
                    rollback_transaction(reason);
                    breaker.spin();
                }
                Err(e) => {
                    // Nothing below begin can produce these.
                    unreachable!("unexpected transaction failure: {}", e)
                }
            }
        }
    }
}

/// Handle through which an atomic region touches shared memory. Not `Send`;
/// it stands for the calling thread's descriptor.
pub struct Tx {
    _not_send: PhantomData<*mut ()>,
}

impl Tx {
    /// Transactional typed read.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads of `V`, properly aligned, and only
    /// ever written through this runtime while transactions are live.
    pub unsafe fn load<V: TmPrimitive>(&mut self, addr: *const V) -> TxResult<V> {
        load(addr, AccessHint::RaR)
    }

    /// Transactional typed write.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for writes of `V` and properly aligned.
    pub unsafe fn store<V: TmPrimitive>(&mut self, addr: *mut V, value: V) -> TxResult<()> {
        store(addr, value, AccessHint::WaW)
    }

    /// Transactional byte copy; see [`memtransfer`].
    ///
    /// # Safety
    ///
    /// Both ranges must be valid for the length.
    pub unsafe fn memtransfer(&mut self, dst: *mut u8, src: *const u8, len: usize) -> TxResult<()> {
        memtransfer(dst, src, len, false, AccessHint::WaW, AccessHint::RaR)
    }

    /// Transactional byte fill; see [`memset`].
    ///
    /// # Safety
    ///
    /// The range must be valid for writes of the length.
    pub unsafe fn memset(&mut self, dst: *mut u8, ch: u8, len: usize) -> TxResult<()> {
        memset(dst, ch, len)
    }

    /// Defers `f` to after the outermost commit; see [`register_on_commit`].
    pub fn on_commit<F: FnOnce() + 'static>(&mut self, f: F) {
        register_on_commit(f)
    }
}

/// Address of a fresh local, marking the lower edge of the live stack.
#[inline(never)]
fn stack_mark() -> usize {
    let marker = 0u8;
    &marker as *const u8 as usize
}

/// Whether the calling thread is inside an atomic region.
pub fn in_transaction() -> bool {
    try_with_descriptor(|tx| tx.map(|t| t.nesting > 0).unwrap_or(false))
}

/// Starts (or flat-nests into) a transaction and reports which code path
/// the caller should execute. `prop` is the instrumentation property word;
/// it is recorded on the descriptor for the duration of the region.
pub fn begin_transaction(prop: u32) -> CodePath {
    with_descriptor(|tx| {
        if tx.nesting > 0 {
            tx.nesting += 1;
            return path_for(Runtime::current());
        }

        tx.next_tid();
        tx.prop = prop;
        let marker = 0u8;
        tx.stack_top = &marker as *const u8 as usize;
        tx.stack_bottom = tx.stack_top;

        let alg = Runtime::current();
        match alg {
            Algorithm::TsxHybrid => htm::begin(tx),
            _ => loop {
                // A held serial lock means a reinitialization (or thread
                // list change) is in flight; publish inactivity and wait it
                // out so the holder can make progress.
                if serial_lock().held() {
                    tx.shared.publish(INACTIVE, Ordering::Release);
                    while serial_lock().held() {
                        core::hint::spin_loop();
                    }
                }

                let begun = match alg {
                    Algorithm::MlLazy => lazy::begin(tx),
                    Algorithm::Norec => norec::begin(tx),
                    Algorithm::TsxHybrid => unreachable!(),
                };
                match begun {
                    Ok(()) => break,
                    Err(TxError::Restart(RestartReason::InitMethodGroup)) => {
                        tx.count_restart(RestartReason::InitMethodGroup);
                        reinit_method_group(alg, tx);
                    }
                    Err(e) => unreachable!("begin cannot fail with {}", e),
                }
            },
        }

        tx.nesting = 1;
        trace!("transaction {} begun ({:?})", tx.id, alg);
        path_for(alg)
    })
}

fn path_for(alg: Algorithm) -> CodePath {
    match alg {
        Algorithm::TsxHybrid => CodePath::Uninstrumented,
        _ => CodePath::Instrumented,
    }
}

/// Timestamp overflow: reset the method group under the serial lock, with
/// every other thread quiescent.
fn reinit_method_group(alg: Algorithm, tx: &mut Descriptor) {
    serial_lock().acquire();

    let overflowed = match alg {
        Algorithm::MlLazy => lazy::time_overflowed(),
        Algorithm::Norec => norec::time_overflowed(),
        Algorithm::TsxHybrid => false,
    };
    // Someone else may have reinitialized while we waited for the lock.
    if overflowed {
        tx.shared.publish(INACTIVE, Ordering::Release);
        wait_for_inactive(&tx.shared);
        match alg {
            Algorithm::MlLazy => lazy::reinit(),
            Algorithm::Norec => norec::reinit(),
            Algorithm::TsxHybrid => {}
        }
        info!("time base overflow: method group reinitialized");
    }

    serial_lock().release();
}

/// Commits the innermost begin; only the outermost one commits for real.
/// On `Err` the caller must roll back and restart the region.
pub fn commit_transaction() -> TxResult<()> {
    let actions: Option<Vec<CommitAction>> = with_descriptor(|tx| {
        assert!(tx.nesting > 0, "commit outside a transaction");
        if tx.nesting > 1 {
            tx.nesting -= 1;
            return Ok(None);
        }

        match Runtime::current() {
            Algorithm::TsxHybrid => {
                htm::commit(tx);
                tx.nesting = 0;
                tx.shared.publish(INACTIVE, Ordering::Release);
                Ok(Some(std::mem::take(&mut tx.commit_actions)))
            }
            alg => {
                let committed = unsafe {
                    match alg {
                        Algorithm::MlLazy => lazy::trycommit(tx),
                        Algorithm::Norec => norec::trycommit(tx),
                        Algorithm::TsxHybrid => unreachable!(),
                    }
                }?;

                tx.nesting = 0;
                tx.shared.publish(INACTIVE, Ordering::Release);
                if let Some(priv_time) = committed {
                    // Our writes must be visible to every ongoing
                    // transaction before the application reads the data
                    // without instrumentation.
                    quiesce(priv_time, &tx.shared);
                }
                trace!("transaction {} committed", tx.id);
                Ok(Some(std::mem::take(&mut tx.commit_actions)))
            }
        }
    })?;

    if let Some(actions) = actions {
        for action in actions {
            action();
        }
    }
    Ok(())
}

/// Exception-handling commit variant; behaves exactly like
/// [`commit_transaction`] (full exception support is not provided).
pub fn commit_transaction_eh(_exc_ptr: *mut ()) -> TxResult<()> {
    commit_transaction()
}

/// Abandons the current attempt: releases whatever the algorithm acquired,
/// clears the logs, discards pending commit actions and leaves the region.
pub fn rollback_transaction(reason: RestartReason) {
    with_descriptor(|tx| {
        if tx.nesting == 0 {
            return;
        }
        tx.count_restart(reason);

        match Runtime::current() {
            // Hardware aborts restart automatically and the serial path
            // cannot abort, so there is nothing to undo here.
            Algorithm::TsxHybrid => {}
            Algorithm::MlLazy => lazy::rollback(tx),
            Algorithm::Norec => norec::rollback(tx),
        }

        tx.commit_actions.clear();
        tx.nesting = 0;
        tx.shared.publish(INACTIVE, Ordering::Release);
    })
}

/// Application-requested aborts are not supported.
pub fn abort_transaction(reason: u32) -> ! {
    error!("abort_transaction({}) called; aborts are not supported", reason);
    std::process::abort();
}

/// Typed transactional read.
///
/// # Safety
///
/// `addr` must be valid for reads of `V` and properly aligned.
pub unsafe fn load<V: TmPrimitive>(addr: *const V, _hint: AccessHint) -> TxResult<V> {
    with_descriptor(|tx| {
        if tx.nesting == 0 {
            return Ok(unsafe { addr.read() });
        }
        match Runtime::current() {
            Algorithm::TsxHybrid => Ok(unsafe { addr.read() }),
            alg => {
                let bottom = stack_mark();
                tx.stack_bottom = bottom;
                if tx.in_stack_frame(addr as usize, core::mem::size_of::<V>(), bottom) {
                    return Ok(unsafe { addr.read() });
                }
                unsafe {
                    match alg {
                        Algorithm::MlLazy => lazy::load(tx, addr),
                        Algorithm::Norec => norec::load(tx, addr),
                        Algorithm::TsxHybrid => unreachable!(),
                    }
                }
            }
        }
    })
}

/// Typed transactional write.
///
/// # Safety
///
/// `addr` must be valid for writes of `V` and properly aligned.
pub unsafe fn store<V: TmPrimitive>(addr: *mut V, value: V, _hint: AccessHint) -> TxResult<()> {
    with_descriptor(|tx| {
        if tx.nesting == 0 {
            unsafe { addr.write(value) };
            return Ok(());
        }
        match Runtime::current() {
            Algorithm::TsxHybrid => {
                unsafe { addr.write(value) };
                Ok(())
            }
            alg => {
                let bottom = stack_mark();
                tx.stack_bottom = bottom;
                if tx.in_stack_frame(addr as usize, core::mem::size_of::<V>(), bottom) {
                    unsafe { addr.write(value) };
                    return Ok(());
                }
                match alg {
                    Algorithm::MlLazy => lazy::store(tx, addr, value),
                    Algorithm::Norec => norec::store(tx, addr, value),
                    Algorithm::TsxHybrid => unreachable!(),
                }
                Ok(())
            }
        }
    })
}

/// Byte-granular transactional copy. Overlap is harmless because writes are
/// buffered until commit.
///
/// # Safety
///
/// `src` and `dst` must be valid for `len` bytes.
pub unsafe fn memtransfer(
    dst: *mut u8,
    src: *const u8,
    len: usize,
    _may_overlap: bool,
    _dst_mod: AccessHint,
    _src_mod: AccessHint,
) -> TxResult<()> {
    // Byte-by-byte so every byte gets its own log lookup and no datum
    // crosses a slab boundary.
    for i in 0..len {
        let b = load::<u8>(src.add(i), AccessHint::RaR)?;
        store::<u8>(dst.add(i), b, AccessHint::WaW)?;
    }
    Ok(())
}

/// Byte-granular transactional fill.
///
/// # Safety
///
/// `dst` must be valid for writes of `len` bytes.
pub unsafe fn memset(dst: *mut u8, ch: u8, len: usize) -> TxResult<()> {
    for i in 0..len {
        store::<u8>(dst.add(i), ch, AccessHint::WaW)?;
    }
    Ok(())
}

/// Defers `f` to run once after the outermost commit, in registration
/// order. Rolled-back attempts discard it; outside a transaction it runs
/// immediately.
pub fn register_on_commit<F: FnOnce() + 'static>(f: F) {
    let immediate = try_with_descriptor(|tx| match tx {
        Some(tx) if tx.nesting > 0 => {
            tx.commit_actions.push(Box::new(f));
            None
        }
        _ => Some(f),
    });
    if let Some(f) = immediate {
        f();
    }
}

/// Raw function-pointer form of [`register_on_commit`], for C-style
/// callers. `id` is accepted for ABI compatibility and ignored.
///
/// # Safety
///
/// `arg` must stay valid until after the outermost commit runs the action.
pub unsafe fn register_user_commit_action(
    f: unsafe fn(*mut ()),
    _id: u64,
    arg: *mut (),
) {
    let arg = arg as usize;
    register_on_commit(move || unsafe { f(arg as *mut ()) });
}

/// The calling thread's restart counters, indexed by
/// [`RestartReason::index`]. All zeros for a thread that never ran a
/// transaction.
pub fn restart_counts() -> [u64; RestartReason::COUNT] {
    try_with_descriptor(|tx| tx.map(|t| t.restart_counts).unwrap_or_default())
}

/// Thread-count admission check for the active algorithm.
pub(crate) fn algorithm_supports(threads: usize) -> bool {
    match Runtime::current() {
        Algorithm::MlLazy => lazy::supports(threads),
        Algorithm::Norec => norec::supports(threads),
        Algorithm::TsxHybrid => htm::supports(threads),
    }
}
