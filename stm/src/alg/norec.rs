// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # NOrec
//!
//! No ownership records: a single global sequence lock serializes
//! writeback, and reads are validated by value. The sequence word is even
//! when unlocked (the value is the version) and odd while a committer
//! replays its redo log.

use crate::descriptor::Descriptor;
use crate::error::{restart, RestartReason, TxResult};
use crate::orec::TIME_MAX;
use crate::types::{value_to_bytes, zeroed, TmPrimitive};
use crate::word::{CacheAligned, TmWord};
use lazy_static::lazy_static;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

struct NorecGroup {
    /// The sequence lock; doubles as the time base.
    time: CacheAligned<AtomicUsize>,
}

lazy_static! {
    static ref MG: NorecGroup = NorecGroup {
        time: CacheAligned::new(AtomicUsize::new(0)),
    };
}

/// Snapshots the last-known even version of the sequence lock.
pub fn begin(tx: &mut Descriptor) -> TxResult<()> {
    let snapshot = MG.time.load(Ordering::Acquire) & !1;
    if snapshot >= TIME_MAX {
        return restart(RestartReason::InitMethodGroup);
    }
    tx.shared.publish(snapshot, Ordering::Relaxed);
    Ok(())
}

/// Re-checks every recorded read against memory during a quiet period of
/// the sequence lock. Returns the version the values were consistent at.
///
/// # Safety
///
/// Every address in the value log must still be valid for reads.
unsafe fn validate(tx: &Descriptor) -> TxResult<TmWord> {
    loop {
        // Wait out an in-flight writeback.
        let s = MG.time.load(Ordering::Acquire);
        if s & 1 == 1 {
            core::hint::spin_loop();
            continue;
        }

        if !tx.valuelog.valuecheck() {
            return restart(RestartReason::ValidateRead);
        }

        // Publish before the confirming re-read: privatizers waiting on our
        // snapshot must not overtake the data loads above.
        tx.shared.publish(s, Ordering::Release);
        if MG.time.load(Ordering::Acquire) == s {
            return Ok(s);
        }
    }
}

/// Transactional read: valid iff it happens in a window where the sequence
/// lock is even and unchanged since the snapshot.
///
/// # Safety
///
/// `addr` must be valid for reads of `V` and properly aligned.
pub unsafe fn load<V: TmPrimitive>(tx: &mut Descriptor, addr: *const V) -> TxResult<V> {
    if !tx.redolog.is_empty() {
        let mut buffered = zeroed::<V>();
        if tx.redolog.find(addr, &mut buffered) != 0 {
            return Ok(buffered);
        }
    }

    let mut v = addr.read();
    let mut start_time = tx.shared.load(Ordering::Acquire);
    while start_time != MG.time.load(Ordering::Acquire) {
        start_time = validate(tx)?;
        v = addr.read();
    }

    let (bytes, len) = value_to_bytes(v);
    tx.valuelog.log_read(addr as *const u8, &bytes[..len]);
    Ok(v)
}

/// Buffered write.
pub fn store<V: TmPrimitive>(tx: &mut Descriptor, addr: *const V, value: V) {
    tx.redolog.insert(addr, value);
}

/// Commit: take the sequence lock from our snapshot (validating on
/// contention), write back, and release at `snapshot + 2`.
///
/// # Safety
///
/// Every address in the redo log must still be valid for writes.
pub unsafe fn trycommit(tx: &mut Descriptor) -> TxResult<Option<TmWord>> {
    if tx.redolog.is_empty() {
        tx.valuelog.clear();
        return Ok(None);
    }

    let mut start_time = tx.shared.load(Ordering::Relaxed);
    while MG
        .time
        .compare_exchange_weak(start_time, start_time + 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        start_time = validate(tx)?;
    }

    tx.redolog.writeback();

    // Odd -> even-greater transition orders the writeback before any
    // post-commit reader.
    let ct = start_time + 2;
    MG.time.store(ct, Ordering::Release);

    tx.redolog.reset();
    tx.valuelog.clear();

    Ok(Some(ct))
}

/// The redo log was never written back, so only the logs need to go. The
/// release fence keeps privatizers from observing stale values past our
/// next published snapshot.
pub fn rollback(tx: &mut Descriptor) {
    fence(Ordering::Release);
    tx.redolog.reset();
    tx.valuelog.clear();
}

/// Value-based validation has no per-thread timestamp cost.
pub fn supports(_threads: usize) -> bool {
    true
}

pub fn time_overflowed() -> bool {
    (MG.time.load(Ordering::Relaxed) & !1) >= TIME_MAX
}

/// Resets the sequence lock. Only called while holding the serial lock with
/// every other thread quiescent.
pub fn reinit() {
    MG.time.store(0, Ordering::Relaxed);
}
