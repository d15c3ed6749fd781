//! lexstore engine: environment lifecycle, crash coordination, recovery,
//! transactions, and the pluggable backend dispatch.
//!
//! The engine coordinates independent operating-system processes that share
//! a database directory but no memory. The filesystem is the only
//! coordination medium: a directory-wide advisory lock plus per-process
//! lock cells inside a shared lock file answer "is anyone still using this
//! environment" and "did the previous occupant crash".
//!
//! Entry points:
//! - [`Environment::open`] — open/create the shared environment, running
//!   recovery first when the previous occupant crashed.
//! - [`recover`] / [`purge_logs`] / [`remove`] — maintenance operations on
//!   a directory that is not currently open in this process.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
mod environment;
mod handle;
pub mod lockfile;
mod recovery;
mod transaction;

pub use environment::Environment;
pub use handle::DbHandle;
pub use recovery::{purge_logs, recover, remove};
pub use transaction::TxnState;

pub use lexstore_core::{BackendKind, Durability, Error, OpenMode, Result, Tuning};
