//! Database handles
//!
//! A [`DbHandle`] is one opened logical database inside an environment.
//! It is a thin facade: every operation goes through the environment,
//! which serializes access to the engine and manages the transaction
//! slot. Handles keep the environment alive and must be closed before
//! the environment can be.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lexstore_core::{Error, OpenMode, Result};
use tracing::warn;

use crate::backend::HandleId;
use crate::environment::Environment;

/// An open logical database within an [`Environment`].
pub struct DbHandle {
    env: Arc<Environment>,
    id: HandleId,
    name: String,
    mode: OpenMode,
    byte_swapped: bool,
    created: bool,
    closed: AtomicBool,
}

impl DbHandle {
    pub(crate) fn new(
        env: Arc<Environment>,
        id: HandleId,
        name: String,
        mode: OpenMode,
        byte_swapped: bool,
        created: bool,
    ) -> Self {
        DbHandle {
            env,
            id,
            name,
            mode,
            byte_swapped,
            created,
            closed: AtomicBool::new(false),
        }
    }

    /// The logical database name this handle was opened under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The access mode the handle was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// The environment this handle belongs to.
    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    /// True when the on-disk data was written by a machine of the other
    /// byte order. Values come back as the raw stored bytes; the caller
    /// decides whether and how to normalize.
    pub fn is_byte_swapped(&self) -> bool {
        self.byte_swapped
    }

    /// True when this open created the database.
    pub fn was_created(&self) -> bool {
        self.created
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::InvalidState(format!(
                "database '{}' is closed",
                self.name
            )));
        }
        Ok(())
    }

    /// Look up `key`. Absence is `Ok(None)`, not an error.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.env.kv_get(self.id, key)
    }

    /// Store `value` under `key`, replacing any existing value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_open()?;
        self.env.kv_put(self.id, key, value)
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_open()?;
        self.env.kv_delete(self.id, key)
    }

    /// Visit every key/value pair. Ordering is the engine's: sorted for
    /// the tree- and table-backed engines, unspecified for the hash
    /// engine. Return `ControlFlow::Break(())` to stop early.
    pub fn for_each(
        &self,
        mut visit: impl FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        self.check_open()?;
        self.env.kv_for_each(self.id, &mut visit)
    }

    /// Flush this database's data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.check_open()?;
        self.env.kv_sync(self.id)
    }

    /// Close the handle. Required before the environment can close;
    /// closing twice is an error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState(format!(
                "database '{}' is already closed",
                self.name
            )));
        }
        self.env.handle_closed(self.id)
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(
                target: "lexstore::env",
                db = %self.name,
                "database handle dropped without close"
            );
            if let Err(e) = self.env.handle_closed(self.id) {
                warn!(target: "lexstore::env", db = %self.name, error = %e, "close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("byte_swapped", &self.byte_swapped)
            .field("created", &self.created)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
