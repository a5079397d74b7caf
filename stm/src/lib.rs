// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transactional memory runtime
//!
//! A software transactional memory runtime with three interchangeable
//! synchronization methods behind one dispatch surface:
//!
//! - **ML-Lazy**: ownership-record timestamped STM with redo logging and
//!   snapshot extension,
//! - **NOrec**: sequence-lock STM validating reads by value, with no
//!   ownership records,
//! - **TSX hybrid**: best-effort hardware transactions falling back to a
//!   process-wide serial lock.
//!
//! Application threads mark regions atomic through [`Runtime::atomic`] (or
//! the raw `begin`/`commit` entry points when instrumented externally);
//! conflicting regions retry automatically, committed writes appear at a
//! single linearization point, and commit waits for every concurrent
//! transaction's published snapshot to pass its commit time before handing
//! the data back to uninstrumented code.
//!
//! ```
//! use tmkit_stm::{Runtime, TCell};
//!
//! let counter = TCell::new(0usize);
//! Runtime::atomic(|tx| {
//!     let v = counter.read(tx)?;
//!     counter.write(tx, v + 1)
//! });
//! assert_eq!(unsafe { counter.read_direct() }, 1);
//! ```

#![cfg_attr(target_arch = "x86_64", feature(stdarch_x86_rtm, rtm_target_feature))]

pub mod alg;
pub mod breaker;
pub mod descriptor;
pub mod dispatch;
pub mod error;
pub mod orec;
pub mod redolog;
pub mod serial;
pub mod tcell;
pub mod types;
pub mod valuelog;
pub mod word;

pub use alg::Algorithm;
pub use breaker::BusyBreaker;
pub use dispatch::{
    abort_transaction, begin_transaction, commit_transaction, commit_transaction_eh,
    in_transaction, load, memset, memtransfer, register_on_commit, register_user_commit_action,
    restart_counts, rollback_transaction, store, AccessHint, CodePath, Runtime, Tx,
};
pub use error::{RestartReason, TxError, TxResult};
pub use redolog::RedoLog;
pub use tcell::TCell;
pub use types::TmPrimitive;
pub use valuelog::ValueLog;
pub use word::TmWord;
