//! lexstore - crash-safe key/value storage for word-frequency databases
//!
//! lexstore gives a token-counting application a durable place to keep
//! its counts: a directory-rooted [`Environment`] shared safely between
//! independent processes, logical databases opened through it, and a
//! choice of storage engines behind one key/value interface.
//!
//! # Quick Start
//!
//! ```ignore
//! use lexstore::{BackendKind, Environment, OpenMode, Tuning};
//!
//! let env = Environment::open("/var/lib/wordlists".as_ref(),
//!                             BackendKind::Transactional,
//!                             Tuning::default())?;
//! let db = env.open_db("wordlist", OpenMode::ReadWrite)?;
//!
//! env.begin()?;
//! db.put(b"viagra", &3u32.to_le_bytes())?;
//! env.commit()?;
//!
//! db.close()?;
//! env.close()?;
//! ```
//!
//! # Crash safety
//!
//! Every opener of an environment holds a lock cell in a shared lock
//! file that the kernel releases if the process dies. The next opener
//! notices the orphaned cell and runs the engine's recovery under an
//! exclusive directory lock before anyone touches the data again. The
//! same protocol works across unrelated processes; no daemon is
//! involved.

pub use lexstore_engine::*;
