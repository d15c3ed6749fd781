//! Error types for lexstore
//!
//! This module defines all error types used throughout the storage layer.
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations.
//!
//! The taxonomy distinguishes three classes of failure:
//! - **Retryable**: the engine detected a deadlock or serialization
//!   conflict ([`Error::Conflict`]). The caller must re-run the whole unit
//!   of work from `begin`.
//! - **Busy**: a required lock is held by another process
//!   ([`Error::Busy`]). Key/value operations ride these out internally
//!   with bounded randomized backoff; open and maintenance calls surface
//!   them when the backoff budget runs out.
//! - **Fatal**: everything else. The environment's integrity can no longer
//!   be trusted; the caller should stop using it. Absent keys are not an
//!   error at all — reads return `Ok(None)`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for lexstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the storage layer
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (lock file, engine files, directory operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Engine-level deadlock or serialization conflict.
    ///
    /// The owning transaction has already been aborted. Re-run the whole
    /// unit of work from `begin`.
    #[error("Retryable conflict: {0}")]
    Conflict(String),

    /// A required lock is held by another process.
    ///
    /// Retried with randomized backoff inside the key/value operations;
    /// open and maintenance entry points return it once the backoff
    /// budget is exhausted.
    #[error("Engine busy: {0}")]
    Busy(String),

    /// Underlying storage engine reported an unrecoverable error
    #[error("Engine error ({engine}): {message}")]
    Engine {
        /// Identifier of the engine that failed (e.g. "redb", "sqlite")
        engine: &'static str,
        /// The engine's own error text
        message: String,
    },

    /// On-disk state is corrupt or from an incompatible version
    #[error("Corrupt environment: {0}")]
    Corruption(String),

    /// Programming-contract violation (wrong lifecycle state)
    ///
    /// Examples: committing with no active transaction, closing a handle
    /// twice, beginning a transaction while one is active.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid tuning or open parameters
    #[error("Configuration error: {0}")]
    Config(String),

    /// Recovery could not complete, even catastrophically.
    ///
    /// The message carries actionable guidance (run recovery manually,
    /// or remove and rebuild the environment).
    #[error("Recovery failed for {dir}: {message}")]
    RecoveryFailed {
        /// Environment directory that could not be recovered
        dir: PathBuf,
        /// What failed, including the engine's own error text
        message: String,
    },
}

impl Error {
    /// Convenience constructor for engine errors.
    pub fn engine(engine: &'static str, message: impl Into<String>) -> Self {
        Error::Engine {
            engine,
            message: message.into(),
        }
    }

    /// True if the caller should re-run the whole unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// True if the environment can no longer be trusted.
    ///
    /// Fatal errors are everything that is neither a retryable conflict
    /// nor an internal busy signal. Callers embedding lexstore in a
    /// long-running process typically log the diagnostic and exit.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Conflict(_) | Error::Busy(_))
    }
}
