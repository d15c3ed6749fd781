//! Backend capability table
//!
//! A fixed set of operations implemented differently per backend variant,
//! selected once per environment open and fixed for the process lifetime
//! of that environment. Dispatch is a trait object built by
//! [`open_backend`]; there is no flag branching past the factory.
//!
//! Variants that have no notion of an operation inherit the default
//! implementation, a no-op returning success. That is the contract for
//! `begin`/`commit`/`abort` on the non-transactional variants and for
//! `checkpoint`/`purge_logs` on engines without a write-ahead log.

mod hashfile;
mod plain;
mod relational;
mod transactional;

use std::ops::ControlFlow;
use std::path::Path;

use lexstore_core::{BackendKind, OpenMode, Result, Tuning};

pub(crate) use hashfile::HashFileBackend;
pub(crate) use plain::PlainBackend;
pub(crate) use relational::RelationalBackend;
pub(crate) use transactional::TransactionalBackend;

/// Identifier of one open database handle within a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub(crate) u32);

/// What a backend reports about a freshly opened handle.
#[derive(Debug, Clone)]
pub struct HandleOpened {
    /// Backend-assigned handle identifier.
    pub id: HandleId,
    /// True if the file was produced on a machine with the other integer
    /// endianness. Raw bytes are returned unconverted either way.
    pub byte_swapped: bool,
    /// True if this open created the database rather than finding it.
    pub created: bool,
}

/// Visitor callback for [`Backend::for_each`]. Return
/// `ControlFlow::Break(())` to stop iteration early.
pub type KvVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> ControlFlow<()> + 'a;

/// Operation set every backend variant implements.
///
/// Keys and values are opaque byte sequences. Errors follow the shared
/// taxonomy: engine deadlocks surface as `Error::Conflict` (the caller's
/// transaction is then aborted by the coordinator), transient cross-process
/// engine locking as `Error::Busy` (consumed inside the backend), anything
/// else is fatal-class.
pub trait Backend: Send {
    /// Open one named database inside the environment.
    fn open_handle(&mut self, name: &str, mode: OpenMode) -> Result<HandleOpened>;

    /// Close a handle. Backends may flush or reorganize here.
    fn close_handle(&mut self, id: HandleId) -> Result<()>;

    /// Begin the environment transaction.
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    /// Commit the environment transaction.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Abort the environment transaction.
    fn abort(&mut self) -> Result<()> {
        Ok(())
    }

    /// Read a value. `Ok(None)` for an absent key.
    fn get(&mut self, id: HandleId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Upsert a key/value pair.
    fn put(&mut self, id: HandleId, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key. Absence is success.
    fn delete(&mut self, id: HandleId, key: &[u8]) -> Result<()>;

    /// Visit every pair in engine-defined order (ascending key order for
    /// the page-store variants). Forward-only, non-restartable.
    fn for_each(&mut self, id: HandleId, visit: &mut KvVisitor<'_>) -> Result<()>;

    /// Force buffered changes for one handle to stable storage.
    fn sync(&mut self, id: HandleId) -> Result<()>;

    /// Best-effort partial flush after a commit. Errors are ignored by the
    /// coordinator; durability already comes from the engine's log.
    fn flush_some(&mut self) -> Result<()> {
        Ok(())
    }

    /// Durably checkpoint buffered state, shortening future recovery.
    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }

    /// Delete log segments no longer needed for recovery.
    fn purge_logs(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the environment. All handles must already be closed.
    fn close(&mut self) -> Result<()>;

    /// Variant identifier for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Backend/engine identification string (variant plus engine).
    fn engine_version(&self) -> String;
}

/// Construct the backend for `kind`, creating or opening its on-disk
/// state under `dir` with the supplied tuning.
pub(crate) fn open_backend(
    kind: BackendKind,
    dir: &Path,
    tuning: &Tuning,
) -> Result<Box<dyn Backend>> {
    match kind {
        BackendKind::Transactional => Ok(Box::new(TransactionalBackend::open(dir, tuning)?)),
        BackendKind::NonTransactional => Ok(Box::new(PlainBackend::open(dir, tuning)?)),
        BackendKind::SingleFileHash => Ok(Box::new(HashFileBackend::open(dir, tuning)?)),
        BackendKind::RelationalBlobTable => Ok(Box::new(RelationalBackend::open(dir, tuning)?)),
    }
}

/// Run engine-level recovery for `kind` against `dir`.
///
/// Standard recovery is applied as a side effect of opening the engine;
/// `catastrophic` selects the engine's full-replay/rebuild mode. The
/// caller (the recovery engine) holds the exclusive directory lock.
pub(crate) fn recover_with(
    kind: BackendKind,
    dir: &Path,
    tuning: &Tuning,
    catastrophic: bool,
) -> Result<()> {
    match kind {
        BackendKind::Transactional => TransactionalBackend::recover(dir, tuning, catastrophic),
        // No log to replay: recovery for the plain variant is the
        // exclusive directory lock the caller already holds.
        BackendKind::NonTransactional => Ok(()),
        BackendKind::SingleFileHash => HashFileBackend::recover(dir, tuning, catastrophic),
        BackendKind::RelationalBlobTable => RelationalBackend::recover(dir, tuning, catastrophic),
    }
}

/// Delete the on-disk environment bookkeeping for `kind` under `dir`,
/// after validating/clearing stale state in a private context.
pub(crate) fn remove_with(kind: BackendKind, dir: &Path, tuning: &Tuning) -> Result<()> {
    match kind {
        BackendKind::Transactional => TransactionalBackend::remove(dir, tuning),
        BackendKind::NonTransactional => PlainBackend::remove(dir),
        BackendKind::SingleFileHash => HashFileBackend::remove(dir),
        BackendKind::RelationalBlobTable => RelationalBackend::remove(dir, tuning),
    }
}
