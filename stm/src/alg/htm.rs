// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # TSX hybrid
//!
//! Best-effort hardware transactions coordinated with a serial software
//! path through the process-wide spin lock. A hardware transaction reads
//! the lock right after starting, which puts the lock word into its read
//! set: a serial thread acquiring the lock aborts every hardware
//! transaction in flight, and no hardware transaction can commit while the
//! lock is held.
//!
//! Data accesses run uninstrumented on both paths, so this method has no
//! logs, no validation and no rollback entry point.

use crate::descriptor::Descriptor;
use crate::serial::serial_lock;
use log::*;

/// Hardware attempts before falling back to the serial lock.
#[cfg(target_arch = "x86_64")]
const MAX_ATTEMPTS: u32 = 5;

/// Explicit abort code raised when the lock was observed held inside a
/// hardware transaction.
#[cfg(target_arch = "x86_64")]
const LOCK_HELD: u32 = 0xFF;

#[cfg(target_arch = "x86_64")]
mod rtm {
    use std::sync::atomic::{AtomicU8, Ordering};

    pub use core::arch::x86_64::{_XABORT_EXPLICIT, _XABORT_RETRY, _XBEGIN_STARTED};

    /// Runtime RTM detection, cached after the first probe.
    pub fn supported() -> bool {
        static PROBED: AtomicU8 = AtomicU8::new(2);
        match PROBED.load(Ordering::Relaxed) {
            0 => false,
            1 => true,
            _ => {
                let rtm = std::arch::is_x86_feature_detected!("rtm");
                PROBED.store(rtm as u8, Ordering::Relaxed);
                rtm
            }
        }
    }

    #[target_feature(enable = "rtm")]
    pub unsafe fn begin() -> u32 {
        core::arch::x86_64::_xbegin()
    }

    #[target_feature(enable = "rtm")]
    pub unsafe fn end() {
        core::arch::x86_64::_xend()
    }

    /// Aborts the enclosing hardware transaction with the lock-held code.
    /// Control resumes at the matching `_xbegin` with the abort status.
    #[target_feature(enable = "rtm")]
    pub unsafe fn abort_lock_held() {
        core::arch::x86_64::_xabort(0xFF);
    }

    pub fn abort_code(status: u32) -> u32 {
        (status >> 24) & 0xFF
    }
}

/// Outermost begin: start a hardware transaction if the machine can,
/// otherwise (or after too many aborts) take the serial lock.
pub fn begin(_tx: &mut Descriptor) {
    #[cfg(target_arch = "x86_64")]
    {
        if rtm::supported() {
            let mut attempts = 0;
            loop {
                attempts += 1;
                let status = unsafe { rtm::begin() };
                if status == rtm::_XBEGIN_STARTED {
                    // The lock load joins our read set; a later acquisition
                    // aborts us.
                    if !serial_lock().held_relaxed() {
                        return;
                    }
                    unsafe { rtm::abort_lock_held() };
                } else {
                    // Lock was held when the transaction started; let it
                    // drain before retrying.
                    if status & rtm::_XABORT_EXPLICIT != 0 && rtm::abort_code(status) == LOCK_HELD {
                        while serial_lock().held() {
                            core::hint::spin_loop();
                        }
                    }
                    if attempts > MAX_ATTEMPTS || status & rtm::_XABORT_RETRY == 0 {
                        trace!("hardware path gave up after {} attempts, going serial", attempts);
                        serial_lock().acquire();
                        return;
                    }
                }
            }
        }
    }

    trace!("no hardware transaction support, going serial");
    serial_lock().acquire();
}

/// Outermost commit. If the serial lock is held it is held by us (a
/// hardware transaction would have aborted on any other thread's
/// acquisition), so a held lock means the serial path.
pub fn commit(_tx: &mut Descriptor) {
    if serial_lock().held_relaxed() {
        serial_lock().release();
        return;
    }

    #[cfg(target_arch = "x86_64")]
    unsafe {
        rtm::end()
    };
}

/// The serial fallback serializes everything; any thread count works.
pub fn supports(_threads: usize) -> bool {
    true
}
