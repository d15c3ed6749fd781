//! Non-transactional backend: one page-store file per handle
//!
//! The simple sibling of the transactional variant. There is no shared
//! engine environment and no transactions: every operation is one engine
//! write committed immediately. Each handle takes its own whole-file
//! advisory lock at open time, shared for read-only and exclusive for
//! read-write; there is no log to replay, so "recovery" is nothing more
//! than the exclusive directory lock the recovery engine already holds.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use lexstore_core::{Error, OpenMode, Result, Tuning};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use super::{Backend, HandleId, HandleOpened, KvVisitor};

const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const BYTE_ORDER_TAG: u32 = 0x0102_0304;

fn engine_err<E: std::fmt::Display>(e: E) -> Error {
    Error::engine("redb", e.to_string())
}

fn data_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.db", name))
}

fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.dblock", name))
}

struct PlainHandle {
    db: Database,
    name: String,
    mode: OpenMode,
    // Whole-file advisory lock; released when the handle closes.
    _lock: File,
}

/// Per-handle page-store files, auto-committing one engine transaction
/// per operation.
pub(crate) struct PlainBackend {
    dir: PathBuf,
    cache_bytes: usize,
    handles: HashMap<HandleId, PlainHandle>,
    next_id: u32,
}

impl PlainBackend {
    pub(crate) fn open(dir: &Path, tuning: &Tuning) -> Result<Self> {
        Ok(PlainBackend {
            dir: dir.to_path_buf(),
            cache_bytes: tuning.cache_kb as usize * 1024,
            handles: HashMap::new(),
            next_id: 0,
        })
    }

    /// Delete every page-store file and its sidecar lock under `dir`.
    pub(crate) fn remove(dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("db") | Some("dblock")) {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn acquire_file_lock(&self, name: &str, mode: OpenMode) -> Result<File> {
        let path = lock_path(&self.dir, name);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        let locked = match mode {
            OpenMode::ReadOnly => fs2::FileExt::try_lock_shared(&file),
            OpenMode::ReadWrite => fs2::FileExt::try_lock_exclusive(&file),
        };
        match locked {
            Ok(()) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::Busy(format!(
                "database '{}' is locked by another process",
                name
            ))),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn handle(&self, id: HandleId) -> Result<&PlainHandle> {
        self.handles
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))
    }
}

impl Backend for PlainBackend {
    fn open_handle(&mut self, name: &str, mode: OpenMode) -> Result<HandleOpened> {
        if name.is_empty() {
            return Err(Error::Config("database name must be non-empty".to_string()));
        }
        let lock = self.acquire_file_lock(name, mode)?;

        let path = data_path(&self.dir, name);
        let existed = path.exists();
        if !existed && !mode.is_writable() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database '{}' does not exist", name),
            )));
        }
        let mut builder = Database::builder();
        if self.cache_bytes > 0 {
            builder.set_cache_size(self.cache_bytes);
        }
        let db = builder.create(&path).map_err(engine_err)?;

        let byte_swapped = if existed {
            let txn = db.begin_read().map_err(engine_err)?;
            match txn.open_table(META) {
                Ok(meta) => match meta.get("byte_order").map_err(engine_err)? {
                    Some(raw) => {
                        let bytes: [u8; 4] = raw.value().try_into().map_err(|_| {
                            Error::Corruption("byte-order marker has wrong width".to_string())
                        })?;
                        u32::from_ne_bytes(bytes) != BYTE_ORDER_TAG
                    }
                    None => false,
                },
                Err(redb::TableError::TableDoesNotExist(_)) => false,
                Err(e) => return Err(engine_err(e)),
            }
        } else {
            let txn = db.begin_write().map_err(engine_err)?;
            {
                let mut meta = txn.open_table(META).map_err(engine_err)?;
                meta.insert("byte_order", BYTE_ORDER_TAG.to_ne_bytes().as_slice())
                    .map_err(engine_err)?;
            }
            txn.commit().map_err(engine_err)?;
            false
        };

        let id = HandleId(self.next_id);
        self.next_id += 1;
        debug!(
            target: "lexstore::backend",
            name,
            created = !existed,
            ?mode,
            "plain handle open"
        );
        self.handles.insert(
            id,
            PlainHandle {
                db,
                name: name.to_string(),
                mode,
                _lock: lock,
            },
        );
        Ok(HandleOpened {
            id,
            byte_swapped,
            created: !existed,
        })
    }

    fn close_handle(&mut self, id: HandleId) -> Result<()> {
        let handle = self
            .handles
            .remove(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))?;
        debug!(target: "lexstore::backend", name = %handle.name, "plain handle closed");
        Ok(())
    }

    fn get(&mut self, id: HandleId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.handle(id)?;
        let txn = handle.db.begin_read().map_err(engine_err)?;
        match txn.open_table(DATA) {
            Ok(table) => Ok(table
                .get(key)
                .map_err(engine_err)?
                .map(|guard| guard.value().to_vec())),
            Err(redb::TableError::TableDoesNotExist(_)) => Ok(None),
            Err(e) => Err(engine_err(e)),
        }
    }

    fn put(&mut self, id: HandleId, key: &[u8], value: &[u8]) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.mode.is_writable() {
            return Err(Error::InvalidState(format!(
                "handle '{}' is read-only",
                handle.name
            )));
        }
        let txn = handle.db.begin_write().map_err(engine_err)?;
        {
            let mut table = txn.open_table(DATA).map_err(engine_err)?;
            table.insert(key, value).map_err(engine_err)?;
        }
        txn.commit().map_err(engine_err)
    }

    fn delete(&mut self, id: HandleId, key: &[u8]) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.mode.is_writable() {
            return Err(Error::InvalidState(format!(
                "handle '{}' is read-only",
                handle.name
            )));
        }
        let txn = handle.db.begin_write().map_err(engine_err)?;
        {
            let mut table = txn.open_table(DATA).map_err(engine_err)?;
            table.remove(key).map_err(engine_err)?;
        }
        txn.commit().map_err(engine_err)
    }

    fn for_each(&mut self, id: HandleId, visit: &mut KvVisitor<'_>) -> Result<()> {
        let handle = self.handle(id)?;
        let txn = handle.db.begin_read().map_err(engine_err)?;
        let table = match txn.open_table(DATA) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(engine_err(e)),
        };
        let iter = table.iter().map_err(engine_err)?;
        for entry in iter {
            let (k, v) = entry.map_err(engine_err)?;
            if let ControlFlow::Break(()) = visit(k.value(), v.value()) {
                break;
            }
        }
        Ok(())
    }

    fn sync(&mut self, id: HandleId) -> Result<()> {
        // Auto-commit leaves nothing buffered outside the engine; an empty
        // durable commit forces the engine to sync its state.
        let handle = self.handle(id)?;
        let mut txn = handle.db.begin_write().map_err(engine_err)?;
        txn.set_durability(redb::Durability::Immediate);
        txn.commit().map_err(engine_err)
    }

    fn close(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} handle(s) still open",
                self.handles.len()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "non-transactional"
    }

    fn engine_version(&self) -> String {
        "non-transactional (redb 2)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_autocommit_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mut backend = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert!(h.created);

        backend.put(h.id, b"token", b"3").unwrap();
        assert_eq!(backend.get(h.id, b"token").unwrap(), Some(b"3".to_vec()));
        backend.delete(h.id, b"token").unwrap();
        assert_eq!(backend.get(h.id, b"token").unwrap(), None);
        backend.close_handle(h.id).unwrap();
        backend.close().unwrap();
    }

    #[test]
    fn test_no_transactions_required() {
        let tmp = TempDir::new().unwrap();
        let mut backend = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        // begin/commit are the default no-ops for this variant.
        backend.begin().unwrap();
        backend.commit().unwrap();
        backend.put(h.id, b"k", b"v").unwrap();
        backend.close_handle(h.id).unwrap();
    }

    #[test]
    fn test_missing_database_read_only_fails() {
        let tmp = TempDir::new().unwrap();
        let mut backend = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let err = backend.open_handle("absent", OpenMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_write_lock_excludes_second_writer() {
        let tmp = TempDir::new().unwrap();
        let mut backend = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();

        // A second writer in another backend instance conflicts on the
        // whole-file lock before it ever reaches the engine.
        let mut other = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let err = other.open_handle("words", OpenMode::ReadWrite).unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        backend.close_handle(h.id).unwrap();
    }

    #[test]
    fn test_reopen_reports_not_created() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
            let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
            backend.put(h.id, b"k", b"v").unwrap();
            backend.close_handle(h.id).unwrap();
        }
        let mut backend = PlainBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert!(!h.created);
        assert_eq!(backend.get(h.id, b"k").unwrap(), Some(b"v".to_vec()));
    }
}
