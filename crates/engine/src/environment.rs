//! Environment lifecycle
//!
//! An [`Environment`] ties one on-disk directory to one engine: it runs
//! crash recovery if the directory needs it, takes the shared directory
//! lock, registers this process in the liveness registry, and opens the
//! engine. Logical databases are opened through it as [`DbHandle`]s.
//!
//! A process-wide table tracks which directories are open in this
//! process. Opening the same directory twice is refused, as is a second
//! concurrent shared-file transactional environment: the engine keeps
//! per-environment lock state that does not compose across two open
//! environments in one process.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lexstore_core::{BackendKind, Error, OpenMode, Result, Tuning};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::backend::{self, Backend, HandleId};
use crate::handle::DbHandle;
use crate::lockfile::{self, DirLock, LockMode, ProcessRegistry};
use crate::recovery;
use crate::transaction::{TxnSlot, TxnState};

/// Directories open in this process, by canonical path.
static OPEN_ENVIRONMENTS: Lazy<Mutex<HashMap<PathBuf, BackendKind>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn is_open_in_process(dir: &Path) -> bool {
    OPEN_ENVIRONMENTS.lock().contains_key(dir)
}

const SHARED_LOCK_RETRY_LIMIT: u32 = 50;
const RECOVERY_RACE_RETRY_LIMIT: u32 = 3;

struct EnvInner {
    backend: Box<dyn Backend>,
    txn: TxnSlot,
    registry: ProcessRegistry,
    dir_lock: Option<DirLock>,
    open_handles: HashMap<HandleId, String>,
    closed: bool,
}

/// An open storage environment rooted at one directory.
pub struct Environment {
    dir: PathBuf,
    kind: BackendKind,
    tuning: Tuning,
    inner: Mutex<EnvInner>,
}

impl Environment {
    /// Open (creating if needed) the environment at `dir`.
    ///
    /// If a previous opener of this directory died without closing, crash
    /// recovery runs here, before anything else touches the engine.
    pub fn open(dir: &Path, kind: BackendKind, tuning: Tuning) -> Result<Arc<Environment>> {
        tuning.validate()?;
        std::fs::create_dir_all(dir)?;
        let dir = dir.canonicalize()?;

        {
            let open = OPEN_ENVIRONMENTS.lock();
            if open.contains_key(&dir) {
                return Err(Error::InvalidState(format!(
                    "'{}' is already open in this process",
                    dir.display()
                )));
            }
            if kind == BackendKind::Transactional
                && open.values().any(|k| *k == BackendKind::Transactional)
            {
                return Err(Error::InvalidState(
                    "another transactional environment is already open in this process"
                        .to_string(),
                ));
            }
        }

        // Recovery takes the exclusive lock; the shared lock for normal
        // operation comes after. A process can crash between the two, so
        // re-check under the shared lock and loop.
        for _ in 0..RECOVERY_RACE_RETRY_LIMIT {
            if lockfile::needs_recovery(&dir)? {
                recovery::recover(&dir, kind, &tuning, false, false)?;
            }

            let dir_lock = Self::acquire_shared(&dir)?;
            let mut registry = ProcessRegistry::open(&dir)?;
            if registry.needs_recovery()? {
                // Someone crashed between our recovery pass and the
                // shared lock. Drop everything and start over.
                drop(registry);
                drop(dir_lock);
                continue;
            }
            registry.claim()?;

            let backend = match backend::open_backend(kind, &dir, &tuning) {
                Ok(b) => b,
                Err(e) => {
                    registry.release()?;
                    return Err(e);
                }
            };

            OPEN_ENVIRONMENTS.lock().insert(dir.clone(), kind);
            info!(
                target: "lexstore::env",
                dir = %dir.display(),
                engine = kind.as_str(),
                "environment open"
            );
            return Ok(Arc::new(Environment {
                dir,
                kind,
                tuning,
                inner: Mutex::new(EnvInner {
                    backend,
                    txn: TxnSlot::new(),
                    registry,
                    dir_lock: Some(dir_lock),
                    open_handles: HashMap::new(),
                    closed: false,
                }),
            }));
        }
        Err(Error::Busy(format!(
            "'{}': repeated crashes while opening, giving up",
            dir.display()
        )))
    }

    fn acquire_shared(dir: &Path) -> Result<DirLock> {
        let mut rng = rand::thread_rng();
        for _ in 0..SHARED_LOCK_RETRY_LIMIT {
            if let Some(lock) = DirLock::acquire(dir, LockMode::Shared, false)? {
                return Ok(lock);
            }
            // Exclusive holder means recovery is running; wait it out.
            std::thread::sleep(std::time::Duration::from_millis(rng.gen_range(10..=100)));
        }
        Err(Error::Busy(format!(
            "'{}' is locked for recovery",
            dir.display()
        )))
    }

    /// The canonical directory this environment is rooted at.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The engine variant backing this environment.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// The tuning the environment was opened with.
    pub fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    /// Library and engine version, for diagnostics.
    pub fn version(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "lexstore {} ({})",
            env!("CARGO_PKG_VERSION"),
            inner.backend.engine_version()
        )
    }

    /// Open the logical database `name` inside this environment.
    pub fn open_db(self: &Arc<Self>, name: &str, mode: OpenMode) -> Result<DbHandle> {
        let mut inner = self.lock_open()?;
        let opened = inner.backend.open_handle(name, mode)?;
        inner.open_handles.insert(opened.id, name.to_string());
        debug!(
            target: "lexstore::env",
            db = name,
            created = opened.created,
            byte_swapped = opened.byte_swapped,
            "database open"
        );
        Ok(DbHandle::new(
            Arc::clone(self),
            opened.id,
            name.to_string(),
            mode,
            opened.byte_swapped,
            opened.created,
        ))
    }

    /// Where the environment's transaction slot currently stands.
    pub fn txn_state(&self) -> TxnState {
        self.inner.lock().txn.state()
    }

    /// Start the environment's single transaction.
    pub fn begin(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        inner.txn.begin(&mut *inner.backend)
    }

    /// Commit the active transaction.
    pub fn commit(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        inner.txn.commit(&mut *inner.backend)
    }

    /// Abort the active transaction, discarding its writes.
    pub fn abort(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        inner.txn.abort(&mut *inner.backend)
    }

    /// Force a full checkpoint of the engine.
    pub fn checkpoint(&self) -> Result<()> {
        let mut inner = self.lock_open()?;
        if inner.txn.is_active() {
            return Err(Error::InvalidState(
                "cannot checkpoint with a transaction in flight".to_string(),
            ));
        }
        inner.backend.checkpoint()
    }

    /// Close the environment. Fails while database handles remain open.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::InvalidState(format!(
                "'{}' is already closed",
                self.dir.display()
            )));
        }
        if !inner.open_handles.is_empty() {
            let names: Vec<&str> = inner.open_handles.values().map(String::as_str).collect();
            return Err(Error::InvalidState(format!(
                "database(s) still open: {}",
                names.join(", ")
            )));
        }
        if inner.txn.is_active() {
            return Err(Error::InvalidState(
                "cannot close with a transaction in flight".to_string(),
            ));
        }

        inner.backend.checkpoint()?;
        if self.tuning.auto_purge_logs {
            inner.backend.purge_logs()?;
        }
        inner.backend.close()?;
        // Zero the cell and drop its lock before the registry's
        // descriptor closes, so shutdown reads as clean everywhere.
        inner.registry.release()?;
        inner.dir_lock = None;
        inner.closed = true;
        OPEN_ENVIRONMENTS.lock().remove(&self.dir);
        info!(target: "lexstore::env", dir = %self.dir.display(), "environment closed");
        Ok(())
    }

    fn lock_open(&self) -> Result<parking_lot::MutexGuard<'_, EnvInner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(Error::InvalidState(format!(
                "'{}' is closed",
                self.dir.display()
            )));
        }
        Ok(inner)
    }

    // Data-plane entry points used by DbHandle. A lock conflict inside an
    // active transaction aborts it before the error is returned.

    pub(crate) fn kv_get(&self, id: HandleId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        let result = inner.backend.get(id, key);
        inner.txn.absorb(&mut *inner.backend, result)
    }

    pub(crate) fn kv_put(&self, id: HandleId, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        let result = inner.backend.put(id, key, value);
        inner.txn.absorb(&mut *inner.backend, result)
    }

    pub(crate) fn kv_delete(&self, id: HandleId, key: &[u8]) -> Result<()> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        let result = inner.backend.delete(id, key);
        inner.txn.absorb(&mut *inner.backend, result)
    }

    pub(crate) fn kv_for_each(
        &self,
        id: HandleId,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    ) -> Result<()> {
        let mut inner = self.lock_open()?;
        let inner = &mut *inner;
        let result = inner.backend.for_each(id, visit);
        inner.txn.absorb(&mut *inner.backend, result)
    }

    pub(crate) fn kv_sync(&self, id: HandleId) -> Result<()> {
        let mut inner = self.lock_open()?;
        inner.backend.sync(id)
    }

    pub(crate) fn handle_closed(&self, id: HandleId) -> Result<()> {
        let mut inner = self.lock_open()?;
        if inner.open_handles.remove(&id).is_none() {
            return Err(Error::InvalidState(format!(
                "handle {:?} is not open",
                id
            )));
        }
        inner.backend.close_handle(id)
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The interior mutex is deliberately not touched here; Debug must
        // work while an operation holds it.
        f.debug_struct("Environment")
            .field("dir", &self.dir)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if !inner.closed {
            warn!(
                target: "lexstore::env",
                dir = %self.dir.display(),
                "environment dropped without close, releasing locks"
            );
            if let Err(e) = inner.registry.release() {
                warn!(target: "lexstore::env", error = %e, "could not release liveness cell");
            }
            inner.dir_lock = None;
            OPEN_ENVIRONMENTS.lock().remove(&self.dir);
        }
    }
}
