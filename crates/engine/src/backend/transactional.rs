//! Transactional backend: shared redb environment
//!
//! One page-store file per environment, shared by all handles. Handles map
//! to key prefixes inside a single engine table (handle name, a NUL
//! separator, then the user key), so one engine transaction spans every
//! handle. Transactions begin/commit/abort at the environment; checkpoint
//! and log purge map to the engine's compaction, its durable-housekeeping
//! primitive. Page-level locking and repair are the engine's business.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use lexstore_core::{Durability, Error, OpenMode, Result, Tuning};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use tracing::{debug, warn};

use super::{Backend, HandleId, HandleOpened, KvVisitor};

/// Environment data file, fixed relative name.
const DATA_FILE: &str = "data.redb";

/// All handles share one engine table; keys carry the handle prefix.
const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");

/// Environment metadata: byte-order marker, handle-existence markers.
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// Marker value written at creation in the creator's native byte order.
const BYTE_ORDER_TAG: u32 = 0x0102_0304;

fn engine_err<E: std::fmt::Display>(e: E) -> Error {
    Error::engine("redb", e.to_string())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.bytes().any(|b| b == 0) {
        return Err(Error::Config(format!(
            "invalid database name {:?}: must be non-empty and NUL-free",
            name
        )));
    }
    Ok(())
}

/// `<name>\0<key>`: the NUL separator keeps per-handle key ranges disjoint
/// and preserves ascending user-key order within a handle.
fn encode_key(name: &str, key: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1 + key.len());
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(key);
    buf
}

fn range_start(name: &str) -> Vec<u8> {
    encode_key(name, b"")
}

fn range_end(name: &str) -> Vec<u8> {
    let mut buf = name.as_bytes().to_vec();
    buf.push(1);
    buf
}

struct TxnHandle {
    name: String,
    mode: OpenMode,
}

/// redb-backed transactional environment.
pub(crate) struct TransactionalBackend {
    db: Database,
    txn: Option<WriteTransaction>,
    handles: HashMap<HandleId, TxnHandle>,
    next_id: u32,
    byte_swapped: bool,
    sync_commits: bool,
}

impl TransactionalBackend {
    fn data_path(dir: &Path) -> PathBuf {
        dir.join(DATA_FILE)
    }

    fn builder(tuning: &Tuning) -> redb::Builder {
        let mut builder = Database::builder();
        if tuning.cache_kb > 0 {
            builder.set_cache_size(tuning.cache_kb as usize * 1024);
        }
        builder
    }

    pub(crate) fn open(dir: &Path, tuning: &Tuning) -> Result<Self> {
        let path = Self::data_path(dir);
        let existed = path.exists();
        let db = Self::builder(tuning).create(&path).map_err(engine_err)?;

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

        debug!(
            target: "lexstore::backend",
            dir = %dir.display(),
            created = !existed,
            byte_swapped,
            "transactional environment open"
        );

        Ok(TransactionalBackend {
            db,
            txn: None,
            handles: HashMap::new(),
            next_id: 0,
            byte_swapped,
            sync_commits: tuning.durability == Durability::Sync,
        })
    }

    /// Standard recovery is a side effect of opening the engine; the
    /// catastrophic pass re-opens with the engine's repair callback
    /// engaged, forcing a full rebuild of the page tree.
    pub(crate) fn recover(dir: &Path, tuning: &Tuning, catastrophic: bool) -> Result<()> {
        let path = Self::data_path(dir);
        if !path.exists() {
            return Ok(());
        }
        let mut builder = Self::builder(tuning);
        if catastrophic {
            builder.set_repair_callback(|_session: &mut redb::RepairSession| {
                warn!(target: "lexstore::recovery", "engine repair in progress");
            });
        }
        let db = builder.create(&path).map_err(engine_err)?;
        drop(db);
        Ok(())
    }

    /// Validate/clear stale engine state in a private open, then delete
    /// the environment bookkeeping.
    pub(crate) fn remove(dir: &Path, tuning: &Tuning) -> Result<()> {
        let path = Self::data_path(dir);
        if !path.exists() {
            return Ok(());
        }
        if let Err(e) = Self::recover(dir, tuning, false) {
            warn!(
                target: "lexstore::recovery",
                dir = %dir.display(),
                error = %e,
                "engine state unrecoverable; removing anyway"
            );
        }
        std::fs::remove_file(&path)?;
        Ok(())
    }

    fn active_txn(&self) -> Result<&WriteTransaction> {
        self.txn.as_ref().ok_or_else(|| {
            Error::InvalidState("operation requires an active transaction".to_string())
        })
    }

    fn handle(&self, id: HandleId) -> Result<&TxnHandle> {
        self.handles
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))
    }
}

impl Backend for TransactionalBackend {
    fn open_handle(&mut self, name: &str, mode: OpenMode) -> Result<HandleOpened> {
        validate_name(name)?;
        let marker = format!("handle:{}", name);

        let known = {
            let txn = self.db.begin_read().map_err(engine_err)?;
            match txn.open_table(META) {
                Ok(meta) => meta.get(marker.as_str()).map_err(engine_err)?.is_some(),
                Err(redb::TableError::TableDoesNotExist(_)) => false,
                Err(e) => return Err(engine_err(e)),
            }
        };

        let created = !known && mode.is_writable();
        if created {
            // Record existence inside the active transaction when there is
            // one, so the marker aborts with it.
            if let Some(txn) = &self.txn {
                let mut meta = txn.open_table(META).map_err(engine_err)?;
                meta.insert(marker.as_str(), [1u8].as_slice())
                    .map_err(engine_err)?;
            } else {
                let txn = self.db.begin_write().map_err(engine_err)?;
                {
                    let mut meta = txn.open_table(META).map_err(engine_err)?;
                    meta.insert(marker.as_str(), [1u8].as_slice())
                        .map_err(engine_err)?;
                }
                txn.commit().map_err(engine_err)?;
            }
        }

        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.handles.insert(
            id,
            TxnHandle {
                name: name.to_string(),
                mode,
            },
        );
        Ok(HandleOpened {
            id,
            byte_swapped: self.byte_swapped,
            created,
        })
    }

    fn close_handle(&mut self, id: HandleId) -> Result<()> {
        self.handles
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))
    }

    fn begin(&mut self) -> Result<()> {
        let mut txn = self.db.begin_write().map_err(engine_err)?;
        txn.set_durability(if self.sync_commits {
            redb::Durability::Immediate
        } else {
            redb::Durability::Eventual
        });
        self.txn = Some(txn);
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(|| {
            Error::InvalidState("commit with no active engine transaction".to_string())
        })?;
        txn.commit().map_err(engine_err)
    }

    fn abort(&mut self) -> Result<()> {
        let txn = self.txn.take().ok_or_else(|| {
            Error::InvalidState("abort with no active engine transaction".to_string())
        })?;
        txn.abort().map_err(engine_err)
    }

    fn get(&mut self, id: HandleId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let name = self.handle(id)?.name.clone();
        let encoded = encode_key(&name, key);
        let txn = self.active_txn()?;
        match txn.open_table(DATA) {
            Ok(table) => Ok(table
                .get(encoded.as_slice())
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
        let encoded = encode_key(&handle.name, key);
        let txn = self.active_txn()?;
        let mut table = txn.open_table(DATA).map_err(engine_err)?;
        table
            .insert(encoded.as_slice(), value)
            .map_err(engine_err)?;
        Ok(())
    }

    fn delete(&mut self, id: HandleId, key: &[u8]) -> Result<()> {
        let handle = self.handle(id)?;
        if !handle.mode.is_writable() {
            return Err(Error::InvalidState(format!(
                "handle '{}' is read-only",
                handle.name
            )));
        }
        let encoded = encode_key(&handle.name, key);
        let txn = self.active_txn()?;
        let mut table = txn.open_table(DATA).map_err(engine_err)?;
        table.remove(encoded.as_slice()).map_err(engine_err)?;
        Ok(())
    }

    fn for_each(&mut self, id: HandleId, visit: &mut KvVisitor<'_>) -> Result<()> {
        let name = self.handle(id)?.name.clone();
        let start = range_start(&name);
        let end = range_end(&name);
        let prefix_len = name.len() + 1;
        let txn = self.active_txn()?;
        let table = match txn.open_table(DATA) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(engine_err(e)),
        };
        let iter = table
            .range::<&[u8]>(start.as_slice()..end.as_slice())
            .map_err(engine_err)?;
        for entry in iter {
            let (k, v) = entry.map_err(engine_err)?;
            if let ControlFlow::Break(()) = visit(&k.value()[prefix_len..], v.value()) {
                break;
            }
        }
        Ok(())
    }

    fn sync(&mut self, _id: HandleId) -> Result<()> {
        // Durability is per-commit for this variant; nothing buffered
        // outside the engine transaction.
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(Error::InvalidState(
                "checkpoint with a transaction in flight".to_string(),
            ));
        }
        self.db.compact().map_err(engine_err)?;
        Ok(())
    }

    fn purge_logs(&mut self) -> Result<()> {
        // Compaction reclaims the engine's obsolete pages; redb keeps no
        // external log segments.
        self.checkpoint()
    }

    fn close(&mut self) -> Result<()> {
        if let Some(txn) = self.txn.take() {
            warn!(
                target: "lexstore::backend",
                "environment closing with a transaction in flight; aborting it"
            );
            let _ = txn.abort();
        }
        if !self.handles.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} handle(s) still open",
                self.handles.len()
            )));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "transactional"
    }

    fn engine_version(&self) -> String {
        "transactional (redb 2)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_rw(backend: &mut TransactionalBackend, name: &str) -> HandleOpened {
        backend.open_handle(name, OpenMode::ReadWrite).unwrap()
    }

    #[test]
    fn test_round_trip_within_transaction() {
        let tmp = TempDir::new().unwrap();
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = open_rw(&mut backend, "words");

        backend.begin().unwrap();
        backend.put(h.id, b"hello", b"\x01\x00\x00\x00").unwrap();
        assert_eq!(
            backend.get(h.id, b"hello").unwrap(),
            Some(b"\x01\x00\x00\x00".to_vec())
        );
        backend.commit().unwrap();
        backend.close_handle(h.id).unwrap();
        backend.close().unwrap();
    }

    #[test]
    fn test_abort_discards_writes() {
        let tmp = TempDir::new().unwrap();
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = open_rw(&mut backend, "words");

        backend.begin().unwrap();
        backend.put(h.id, b"k", b"v").unwrap();
        backend.abort().unwrap();

        backend.begin().unwrap();
        assert_eq!(backend.get(h.id, b"k").unwrap(), None);
        backend.abort().unwrap();
    }

    #[test]
    fn test_handles_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let a = open_rw(&mut backend, "spam");
        let b = open_rw(&mut backend, "ham");

        backend.begin().unwrap();
        backend.put(a.id, b"token", b"1").unwrap();
        backend.put(b.id, b"token", b"2").unwrap();
        backend.commit().unwrap();

        backend.begin().unwrap();
        assert_eq!(backend.get(a.id, b"token").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get(b.id, b"token").unwrap(), Some(b"2".to_vec()));
        backend.abort().unwrap();
    }

    #[test]
    fn test_iteration_is_ascending_and_scoped() {
        let tmp = TempDir::new().unwrap();
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let a = open_rw(&mut backend, "spam");
        let b = open_rw(&mut backend, "ham");

        backend.begin().unwrap();
        backend.put(a.id, b"b", b"2").unwrap();
        backend.put(a.id, b"a", b"1").unwrap();
        backend.put(a.id, b"c", b"3").unwrap();
        backend.put(b.id, b"zzz", b"other").unwrap();

        let mut seen = Vec::new();
        backend
            .for_each(a.id, &mut |k, v| {
                seen.push((k.to_vec(), v.to_vec()));
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
        backend.abort().unwrap();
    }

    #[test]
    fn test_created_flag_first_open_only() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend =
                TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
            let h = open_rw(&mut backend, "words");
            assert!(h.created);
            backend.close_handle(h.id).unwrap();
            backend.close().unwrap();
        }
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = open_rw(&mut backend, "words");
        assert!(!h.created);
        assert!(!h.byte_swapped);
    }

    #[test]
    fn test_operation_without_transaction_fails_fast() {
        let tmp = TempDir::new().unwrap();
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let h = open_rw(&mut backend, "words");
        let err = backend.put(h.id, b"k", b"v").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_read_only_handle_rejects_writes() {
        let tmp = TempDir::new().unwrap();
        let mut backend = TransactionalBackend::open(tmp.path(), &Tuning::for_testing()).unwrap();
        let _seed = open_rw(&mut backend, "words");
        let ro = backend.open_handle("words", OpenMode::ReadOnly).unwrap();
        backend.begin().unwrap();
        let err = backend.put(ro.id, b"k", b"v").unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        backend.abort().unwrap();
    }
}
