//! Core types for lexstore
//!
//! This crate defines the foundational types shared by every part of the
//! storage layer:
//! - Error: the error taxonomy (retryable conflicts vs fatal conditions)
//! - Tuning: engine tuning parameters passed into environment open
//! - OpenMode / Durability / BackendKind: open-time selectors
//!
//! Keys and values are opaque byte sequences (`&[u8]` / `Vec<u8>`) at every
//! boundary. No text encoding is implied and no terminator is assumed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;

pub use config::{BackendKind, Durability, OpenMode, Tuning};
pub use error::{Error, Result};
