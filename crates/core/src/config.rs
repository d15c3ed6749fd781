//! Tuning and open-time configuration
//!
//! Tuning parameters are an explicit struct passed into environment open,
//! never process-wide globals, so multiple environments (in tests) do not
//! interfere. Builder-style `with_*` methods follow the usual pattern;
//! `validate()` runs at environment open.

use crate::error::{Error, Result};

/// Default maximum number of engine locks.
pub const DEFAULT_MAX_LOCKS: u32 = 16_384;

/// Default maximum number of engine lock objects.
pub const DEFAULT_MAX_LOCK_OBJECTS: u32 = 16_384;

/// Default log segment size in bytes (1 MiB).
pub const DEFAULT_LOG_SEGMENT_SIZE: u32 = 1024 * 1024;

/// How a database handle is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only; writes are rejected by the backend.
    ReadOnly,
    /// Reads and writes.
    ReadWrite,
}

impl OpenMode {
    /// True for `ReadWrite`.
    pub fn is_writable(self) -> bool {
        matches!(self, OpenMode::ReadWrite)
    }
}

/// Durability policy applied by the backend on commit/sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Engine default: commits are logged, fsync policy left to the engine.
    #[default]
    Standard,
    /// Every commit is synchronized to stable storage before returning.
    Sync,
}

/// Which storage backend variant serves an environment.
///
/// Selected once at open time and fixed for the process lifetime of that
/// environment. Each variant is a concrete implementation of the backend
/// capability table; there is no runtime flag branching past the factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Shared transactional page-store environment (redb): transactions at
    /// the environment, deadlock handling, checkpoint and log-purge support.
    Transactional,
    /// Per-handle page-store files without transactions (redb,
    /// auto-commit); whole-file advisory lock per handle.
    NonTransactional,
    /// Single-file log-structured hash engine; one lock per opened file,
    /// reorganization on close past a fill-ratio threshold.
    SingleFileHash,
    /// Relational engine (SQLite) holding one blob table namespaced by
    /// database name.
    RelationalBlobTable,
}

impl BackendKind {
    /// Short identifier used in logs and the version string.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Transactional => "transactional",
            BackendKind::NonTransactional => "non-transactional",
            BackendKind::SingleFileHash => "hashfile",
            BackendKind::RelationalBlobTable => "relational",
        }
    }

    /// True if begin/commit/abort are real operations for this variant.
    pub fn is_transactional(self) -> bool {
        matches!(
            self,
            BackendKind::Transactional | BackendKind::RelationalBlobTable
        )
    }
}

/// Engine tuning parameters.
///
/// Lock-table sizes only matter to engines that keep lock tables; other
/// variants accept and ignore them. `cache_kb = 0` means "engine default".
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Maximum number of engine locks (default 16384).
    pub max_locks: u32,
    /// Maximum number of engine lock objects (default 16384).
    pub max_lock_objects: u32,
    /// Write-ahead log segment size in bytes (default 1 MiB).
    pub log_segment_size: u32,
    /// Engine cache size in KiB; 0 uses the engine default.
    pub cache_kb: u32,
    /// Delete write-ahead log segments no longer needed for recovery
    /// when the environment closes.
    pub auto_purge_logs: bool,
    /// Durability mode for commits.
    pub durability: Durability,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            max_locks: DEFAULT_MAX_LOCKS,
            max_lock_objects: DEFAULT_MAX_LOCK_OBJECTS,
            log_segment_size: DEFAULT_LOG_SEGMENT_SIZE,
            cache_kb: 0,
            auto_purge_logs: false,
            durability: Durability::Standard,
        }
    }
}

impl Tuning {
    /// Create a tuning configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum lock count (builder pattern).
    pub fn with_max_locks(mut self, max_locks: u32) -> Self {
        self.max_locks = max_locks;
        self
    }

    /// Set the maximum lock-object count (builder pattern).
    pub fn with_max_lock_objects(mut self, max_lock_objects: u32) -> Self {
        self.max_lock_objects = max_lock_objects;
        self
    }

    /// Set the log segment size in bytes (builder pattern).
    pub fn with_log_segment_size(mut self, bytes: u32) -> Self {
        self.log_segment_size = bytes;
        self
    }

    /// Set the cache size in KiB (builder pattern).
    pub fn with_cache_kb(mut self, cache_kb: u32) -> Self {
        self.cache_kb = cache_kb;
        self
    }

    /// Enable or disable automatic log purge at close (builder pattern).
    pub fn with_auto_purge_logs(mut self, enabled: bool) -> Self {
        self.auto_purge_logs = enabled;
        self
    }

    /// Set the durability mode (builder pattern).
    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_locks == 0 {
            return Err(Error::Config("max_locks must be nonzero".to_string()));
        }
        if self.max_lock_objects == 0 {
            return Err(Error::Config(
                "max_lock_objects must be nonzero".to_string(),
            ));
        }
        if self.log_segment_size < 64 * 1024 {
            return Err(Error::Config(
                "log_segment_size must be at least 64 KiB".to_string(),
            ));
        }
        Ok(())
    }

    /// Configuration suited to tests: small log segments, tiny cache.
    pub fn for_testing() -> Self {
        Tuning {
            log_segment_size: 64 * 1024,
            cache_kb: 512,
            ..Tuning::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let t = Tuning::default();
        assert_eq!(t.max_locks, 16_384);
        assert_eq!(t.max_lock_objects, 16_384);
        assert_eq!(t.log_segment_size, 1024 * 1024);
        assert_eq!(t.cache_kb, 0);
        assert!(!t.auto_purge_logs);
        assert_eq!(t.durability, Durability::Standard);
    }

    #[test]
    fn test_builder_chain() {
        let t = Tuning::new()
            .with_max_locks(1024)
            .with_max_lock_objects(2048)
            .with_log_segment_size(128 * 1024)
            .with_cache_kb(4096)
            .with_auto_purge_logs(true)
            .with_durability(Durability::Sync);
        assert_eq!(t.max_locks, 1024);
        assert_eq!(t.max_lock_objects, 2048);
        assert_eq!(t.log_segment_size, 128 * 1024);
        assert_eq!(t.cache_kb, 4096);
        assert!(t.auto_purge_logs);
        assert_eq!(t.durability, Durability::Sync);
    }

    #[test]
    fn test_validate_rejects_zero_locks() {
        let t = Tuning::new().with_max_locks(0);
        assert!(matches!(t.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_tiny_log_segment() {
        let t = Tuning::new().with_log_segment_size(1024);
        assert!(matches!(t.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_for_testing_validates() {
        assert!(Tuning::for_testing().validate().is_ok());
    }

    #[test]
    fn test_backend_kind_transactionality() {
        assert!(BackendKind::Transactional.is_transactional());
        assert!(BackendKind::RelationalBlobTable.is_transactional());
        assert!(!BackendKind::NonTransactional.is_transactional());
        assert!(!BackendKind::SingleFileHash.is_transactional());
    }

    #[test]
    fn test_open_mode() {
        assert!(OpenMode::ReadWrite.is_writable());
        assert!(!OpenMode::ReadOnly.is_writable());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_validate_accepts_in_range_values(
                max_locks in 1u32..=1_000_000,
                max_lock_objects in 1u32..=1_000_000,
                log_segment_size in (64 * 1024u32)..=(64 * 1024 * 1024),
                cache_kb in 0u32..=1_000_000,
            ) {
                let t = Tuning::new()
                    .with_max_locks(max_locks)
                    .with_max_lock_objects(max_lock_objects)
                    .with_log_segment_size(log_segment_size)
                    .with_cache_kb(cache_kb);
                prop_assert!(t.validate().is_ok());
            }

            #[test]
            fn prop_validate_rejects_short_log_segments(
                log_segment_size in 0u32..(64 * 1024)
            ) {
                let t = Tuning::new().with_log_segment_size(log_segment_size);
                prop_assert!(t.validate().is_err());
            }
        }
    }
}
