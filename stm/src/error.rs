// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Why a transaction attempt has to be thrown away and re-executed.
///
/// Restarts are part of normal operation; the per-thread descriptor counts
/// them by reason so contention is observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// A read hit an ownership record locked by another thread.
    LockedRead,

    /// Write acquisition hit an ownership record locked by another thread.
    LockedWrite,

    /// Snapshot extension failed; an earlier read is no longer consistent.
    ValidateRead,

    /// The time base is about to overflow; the algorithm must be
    /// reinitialized under the serial lock before the attempt can proceed.
    InitMethodGroup,
}

impl RestartReason {
    /// Number of distinct reasons, for counter arrays.
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            RestartReason::LockedRead => 0,
            RestartReason::LockedWrite => 1,
            RestartReason::ValidateRead => 2,
            RestartReason::InitMethodGroup => 3,
        }
    }
}

#[derive(Debug, DeriveError, PartialEq, Eq)]
pub enum TxError {
    /// The current attempt is invalid and must be retried from `begin`.
    #[error("transaction must restart ({0:?})")]
    Restart(RestartReason),

    /// `Runtime::select` was called after the algorithm had been fixed.
    #[error("runtime algorithm is already selected")]
    AlreadySelected,

    /// The selected algorithm cannot serve this many concurrent threads
    /// without risking timestamp overflow.
    #[error("too many threads for the configured overflow reserve")]
    TooManyThreads,
}

pub type TxResult<T> = core::result::Result<T, TxError>;

/// Shorthand used all over the algorithms.
pub(crate) fn restart<T>(reason: RestartReason) -> TxResult<T> {
    Err(TxError::Restart(reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_indices_are_dense() {
        let reasons = [
            RestartReason::LockedRead,
            RestartReason::LockedWrite,
            RestartReason::ValidateRead,
            RestartReason::InitMethodGroup,
        ];
        let mut seen = [false; RestartReason::COUNT];
        for r in reasons {
            seen[r.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }
}
