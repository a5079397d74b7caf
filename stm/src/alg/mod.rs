// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The interchangeable transaction algorithms. Exactly one of them is
//! active per process; the dispatch layer routes every entry point to it.

pub mod htm;
pub mod lazy;
pub mod norec;

/// Which synchronization method the process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Ownership-record timestamped STM with redo logging and snapshot
    /// extension.
    MlLazy,

    /// Sequence-lock STM with value-based validation and no ownership
    /// records.
    Norec,

    /// Best-effort hardware transactions with a serial-lock fallback.
    TsxHybrid,
}
