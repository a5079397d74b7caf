// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # ML-Lazy
//!
//! The multi-lock lazy-versioning method. Each memory location maps to one
//! ownership record; writes are buffered in the redo log and the covering
//! orecs are acquired only at commit. Reads validate against a snapshot
//! time that can be extended forward when an unrelated commit has advanced
//! the clock.
//!
//! The fence pairing is the load-bearing part: a committer issues a release
//! fence between acquiring an orec and writing data back, and a reader pairs
//! its data load with an acquire fence before re-checking the orec. A reader
//! that saw pre-writeback data therefore either sees the locked orec or a
//! newer timestamp, and restarts.

use crate::descriptor::{Descriptor, OrecEntry};
use crate::error::{restart, RestartReason, TxResult};
use crate::orec::{self, OrecTable, OVERFLOW_RESERVE, TIME_MAX};
use crate::types::{zeroed, TmPrimitive};
use crate::word::{CacheAligned, TmWord};
use lazy_static::lazy_static;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

struct LazyGroup {
    /// The shared time base.
    time: CacheAligned<AtomicUsize>,

    /// The ownership records.
    orecs: OrecTable,
}

lazy_static! {
    static ref MG: LazyGroup = LazyGroup {
        time: CacheAligned::new(AtomicUsize::new(0)),
        orecs: OrecTable::new(),
    };
}

/// Establishes the snapshot time for a fresh attempt. Acquire on the time
/// base synchronizes with the commit-time increments of update
/// transactions, so every orec this snapshot admits was released before the
/// time we read.
pub fn begin(tx: &mut Descriptor) -> TxResult<()> {
    let snapshot = MG.time.load(Ordering::Acquire);
    if snapshot >= TIME_MAX {
        return restart(RestartReason::InitMethodGroup);
    }

    // No ordering needed: there are no earlier data loads in this attempt,
    // and a stale smaller value only makes quiescence wait longer.
    tx.shared.publish(snapshot, Ordering::Relaxed);
    Ok(())
}

/// True iff every orec in the read log still carries the observed
/// timestamp, or is locked by this transaction itself.
fn validate(tx: &Descriptor) -> bool {
    let locked_by_tx = orec::locked_by(tx);
    for entry in &tx.readlog {
        // Relaxed suffices: callers bound the recency via an acquire load
        // (extend) or an acq-rel increment (trycommit) of the time base.
        let o = MG.orecs.load(entry.orec, Ordering::Relaxed);
        if o != entry.value && o != locked_by_tx {
            return false;
        }
    }
    true
}

/// Tries to move the snapshot up to the current global time. On success the
/// new snapshot is published for privatizers; on failure the attempt is
/// over.
fn extend(tx: &mut Descriptor) -> TxResult<TmWord> {
    let snapshot = MG.time.load(Ordering::Acquire);
    if !validate(tx) {
        return restart(RestartReason::ValidateRead);
    }
    tx.shared.publish(snapshot, Ordering::Release);
    Ok(snapshot)
}

/// First pass over the orecs covering `[addr, addr + len)`: record each one
/// in the read log, extending the snapshot where needed.
fn pre_load(tx: &mut Descriptor, addr: usize, len: usize) -> TxResult<usize> {
    let log_start = tx.readlog.len();
    let mut snapshot = tx.shared.load(Ordering::Relaxed);
    let locked_by_tx = orec::locked_by(tx);

    let mut orec_i = orec::orec_index(addr);
    let orec_end = orec::orec_range_end(addr, len);
    loop {
        // Acquire pairs with the release store that frees the orec at
        // commit, so the data loads that follow read from the committed
        // values.
        let o = MG.orecs.load(orec_i, Ordering::Acquire);

        if !orec::is_more_recent_or_locked(o, snapshot) {
            tx.readlog.push(OrecEntry { orec: orec_i, value: o });
        } else if !orec::is_locked(o) {
            // Updated past our snapshot; readable again once the snapshot
            // catches up.
            snapshot = extend(tx)?;
            tx.readlog.push(OrecEntry { orec: orec_i, value: o });
        } else if o != locked_by_tx {
            return restart(RestartReason::LockedRead);
        }

        orec_i = orec::next_orec(orec_i);
        if orec_i == orec_end {
            break;
        }
    }
    Ok(log_start)
}

/// Second pass: the raw orec words must be unchanged, otherwise the data
/// load raced with a writeback and the attempt is inconsistent.
fn post_load(tx: &Descriptor, log_start: usize) -> TxResult<()> {
    for entry in &tx.readlog[log_start..] {
        let o = MG.orecs.load(entry.orec, Ordering::Relaxed);
        if entry.value != o {
            return restart(RestartReason::ValidateRead);
        }
    }
    Ok(())
}

/// Transactional read of one primitive.
///
/// # Safety
///
/// `addr` must be valid for reads of `V` and properly aligned. Stack-local
/// addresses are filtered out by the dispatch layer before this runs.
pub unsafe fn load<V: TmPrimitive>(tx: &mut Descriptor, addr: *const V) -> TxResult<V> {
    if !tx.redolog.is_empty() {
        let mut buffered = zeroed::<V>();
        if tx.redolog.find(addr, &mut buffered) != 0 {
            return Ok(buffered);
        }
    }

    let log_start = pre_load(tx, addr as usize, core::mem::size_of::<V>())?;

    // Plain load plus an acquire fence stands in for an atomic acquire
    // load; the fence pairs with the committer's release fence ahead of its
    // writeback.
    let v = addr.read();
    fence(Ordering::Acquire);

    post_load(tx, log_start)?;
    Ok(v)
}

/// Transactional write of one primitive: buffered, nothing shared is
/// touched until commit.
pub fn store<V: TmPrimitive>(tx: &mut Descriptor, addr: *const V, value: V) {
    tx.redolog.insert(addr, value);
}

/// Acquires every orec covering `[addr, addr + len)` for this transaction,
/// logging each orec's prior word for rollback.
fn pre_write(tx: &mut Descriptor, addr: usize, len: usize) -> TxResult<()> {
    let mut snapshot = tx.shared.load(Ordering::Relaxed);
    let locked_by_tx = orec::locked_by(tx);

    let mut orec_i = orec::orec_index(addr);
    let orec_end = orec::orec_range_end(addr, len);
    loop {
        // Relaxed is enough here; the CAS below re-reads with acquire
        // strength if we actually take the orec.
        let o = MG.orecs.load(orec_i, Ordering::Relaxed);

        if o != locked_by_tx {
            if orec::is_locked(o) {
                return restart(RestartReason::LockedWrite);
            }

            // Keep the snapshot at least as new as the orec, so our own
            // acquisition cannot mask an invalidation of earlier reads.
            if o > snapshot {
                snapshot = extend(tx)?;
            }

            if MG
                .orecs
                .compare_exchange(orec_i, o, locked_by_tx, Ordering::Acquire)
                .is_err()
            {
                return restart(RestartReason::LockedWrite);
            }

            // Orders the data stores of the upcoming writeback after the
            // acquisition, pairing with readers' acquire fences.
            fence(Ordering::Release);

            tx.writelog.push(OrecEntry {
                orec: orec_i,
                value: o,
            });
        }

        orec_i = orec::next_orec(orec_i);
        if orec_i == orec_end {
            break;
        }
    }
    Ok(())
}

/// Commit: acquire the write set's orecs, take a commit time, validate if
/// anything moved, write back, release the orecs at the commit time.
/// Returns the privatization time when shared memory was written.
///
/// # Safety
///
/// Every address in the redo log must still be valid for writes.
pub unsafe fn trycommit(tx: &mut Descriptor) -> TxResult<Option<TmWord>> {
    if tx.redolog.is_empty() {
        tx.readlog.clear();
        return Ok(None);
    }

    // 16-byte stripes map to one orec each, so a slab covers at most four
    // orecs; probe its mask one quarter at a time.
    for i in 0..tx.redolog.slabcount() {
        let mask = tx.redolog.get_mask(i);
        let key = tx.redolog.get_key(i);
        if mask & 0x0000_0000_0000_FFFF != 0 {
            pre_write(tx, key, 16)?;
        }
        if mask & 0x0000_0000_FFFF_0000 != 0 {
            pre_write(tx, key + 16, 16)?;
        }
        if mask & 0x0000_FFFF_0000_0000 != 0 {
            pre_write(tx, key + 32, 16)?;
        }
        if mask & 0xFFFF_0000_0000_0000 != 0 {
            pre_write(tx, key + 48, 16)?;
        }
    }

    // Acq-rel: acquire for our own validation below, release so that other
    // threads' validate() observes our lock acquisitions before the new
    // time. Overflow is prevented in begin().
    let ct = MG.time.fetch_add(1, Ordering::AcqRel) + 1;

    // If nobody committed between our snapshot and our commit time, the
    // read set cannot have changed.
    let snapshot = tx.shared.load(Ordering::Relaxed);
    if snapshot < ct - 1 && !validate(tx) {
        return restart(RestartReason::ValidateRead);
    }

    tx.redolog.writeback();

    // Release the orecs at the commit time; pairs with readers' acquire
    // loads in pre_load().
    for entry in &tx.writelog {
        MG.orecs.store(entry.orec, ct, Ordering::Release);
    }

    tx.writelog.clear();
    tx.readlog.clear();
    tx.redolog.reset();

    Ok(Some(ct))
}

/// Releases any acquired orecs by restoring their prior words and clears
/// the logs. The release fence makes privatizers that read our next
/// published snapshot see the restored words, not buffered ones.
pub fn rollback(tx: &mut Descriptor) {
    for entry in &tx.writelog {
        MG.orecs.store(entry.orec, entry.value, Ordering::Release);
    }
    fence(Ordering::Release);

    tx.writelog.clear();
    tx.readlog.clear();
    tx.redolog.reset();
}

/// Every transaction can commit once and roll back once per overflow check,
/// which bounds how many threads the reserve can absorb.
pub fn supports(threads: usize) -> bool {
    threads * 2 <= OVERFLOW_RESERVE
}

pub fn time_overflowed() -> bool {
    MG.time.load(Ordering::Relaxed) >= TIME_MAX
}

/// Resets the time base and the orec table. Only called while holding the
/// serial lock with every other thread quiescent.
pub fn reinit() {
    MG.time.store(0, Ordering::Relaxed);
    MG.orecs.reinit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::SharedState;
    use std::sync::Arc;

    fn scratch_descriptor() -> Descriptor {
        let mut tx = Descriptor::new(Arc::new(SharedState::new()));
        begin(&mut tx).expect("begin failed");
        tx
    }

    #[test]
    fn test_read_own_write() {
        let mut tx = scratch_descriptor();
        let cell = Box::new(5u64);
        let addr = &*cell as *const u64;

        unsafe {
            assert_eq!(load(&mut tx, addr).unwrap(), 5);
            store(&mut tx, addr, 11u64);
            assert_eq!(load(&mut tx, addr).unwrap(), 11);
        }
        // The buffered write is not visible in memory yet.
        assert_eq!(*cell, 5);
        rollback(&mut tx);
    }

    #[test]
    fn test_commit_writes_back_and_stamps_orecs() {
        let mut tx = scratch_descriptor();
        let mut cell = Box::new(1u64);
        let addr = &mut *cell as *mut u64 as *const u64;

        unsafe {
            store(&mut tx, addr, 2u64);
            let ct = trycommit(&mut tx).unwrap().expect("update commit has a priv time");
            assert_eq!(*cell, 2);

            let o = MG.orecs.load(orec::orec_index(addr as usize), Ordering::Acquire);
            assert!(!orec::is_locked(o));
            assert_eq!(o, ct);
        }
        assert!(tx.redolog.is_empty());
        assert!(tx.writelog.is_empty());
    }

    #[test]
    fn test_read_only_commit_is_trivial() {
        let mut tx = scratch_descriptor();
        let cell = Box::new(9u64);

        unsafe {
            assert_eq!(load(&mut tx, &*cell as *const u64).unwrap(), 9);
            assert_eq!(trycommit(&mut tx).unwrap(), None);
        }
        assert!(tx.readlog.is_empty());
    }

    #[test]
    fn test_rollback_restores_orecs() {
        let mut tx = scratch_descriptor();
        let cell = Box::new(3u32);
        let addr = &*cell as *const u32;
        let idx = orec::orec_index(addr as usize);

        let before = MG.orecs.load(idx, Ordering::Acquire);
        store(&mut tx, addr, 4u32);

        // Acquire the covering orec the way commit would, then abandon.
        pre_write(&mut tx, addr as usize, 4).unwrap();
        assert!(orec::is_locked(MG.orecs.load(idx, Ordering::Acquire)));

        rollback(&mut tx);
        assert_eq!(MG.orecs.load(idx, Ordering::Acquire), before);
        assert_eq!(*cell, 3);
    }

    #[test]
    fn test_snapshot_extension_accepts_unrelated_commit() {
        // Two words in one 16-byte stripe share an ownership record.
        #[repr(align(16))]
        struct Stripe {
            a: u64,
            b: u64,
        }

        let mut reader = scratch_descriptor();
        let x = Box::new(10u64);
        let mut stripe = Box::new(Stripe { a: 20, b: 0 });
        let b_addr = &mut stripe.b as *mut u64 as *const u64;

        unsafe {
            assert_eq!(load(&mut reader, &*x as *const u64).unwrap(), 10);

            // A writer commits to the stripe's other word, stamping the
            // shared orec past the reader's snapshot.
            let mut writer = scratch_descriptor();
            store(&mut writer, b_addr, 1u64);
            let ct = trycommit(&mut writer).unwrap().unwrap();

            // Reading the freshly-stamped stripe forces an extension; the
            // read of x stays valid, so the extension and the commit go
            // through.
            assert_eq!(load(&mut reader, &stripe.a as *const u64).unwrap(), 20);
            assert!(reader.shared.load(Ordering::Acquire) >= ct);
            assert!(trycommit(&mut reader).is_ok());
        }
    }
}
