//! Relational blob-table backend
//!
//! All logical databases of one environment share a single SQLite file in
//! WAL mode. Key/value pairs live in one `kv` table namespaced by the
//! logical database name, so handle names never reach the SQL identifier
//! layer. Transactions map straight onto SQLite transactions with
//! `BEGIN IMMEDIATE` so lock conflicts surface at begin rather than at
//! commit.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use lexstore_core::{Durability, Error, OpenMode, Result, Tuning};
use rand::Rng;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use tracing::{debug, warn};

use super::{Backend, HandleId, HandleOpened, KvVisitor};

const DATA_FILE: &str = "data.sqlite";
const BYTE_ORDER_TAG: u32 = 0x0102_0304;
const BUSY_RETRY_LIMIT: u32 = 20;

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// `wal_checkpoint` reports (busy, log, checkpointed) as a result row, so
/// it must run as a query.
fn checkpoint_wal(conn: &Connection, mode: &str) -> rusqlite::Result<()> {
    conn.query_row(&format!("PRAGMA wal_checkpoint({})", mode), [], |_| Ok(()))
}

fn sql_err(err: rusqlite::Error) -> Error {
    if is_busy(&err) {
        Error::Busy(err.to_string())
    } else {
        Error::engine("sqlite", err.to_string())
    }
}

struct SqlHandle {
    name: String,
    mode: OpenMode,
}

/// SQLite-backed environment: one file, one `kv` table, transactions
/// required for every data operation.
pub(crate) struct RelationalBackend {
    conn: Connection,
    handles: HashMap<HandleId, SqlHandle>,
    next_id: u32,
    in_txn: bool,
    byte_swapped: bool,
}

impl RelationalBackend {
    pub(crate) fn open(dir: &Path, tuning: &Tuning) -> Result<Self> {
        let path = dir.join(DATA_FILE);
        let conn = Connection::open(&path).map_err(sql_err)?;
        Self::configure(&conn, tuning)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (k TEXT PRIMARY KEY, v BLOB NOT NULL);\n\
             CREATE TABLE IF NOT EXISTS kv (\n\
                 db  TEXT NOT NULL,\n\
                 key BLOB NOT NULL,\n\
                 value BLOB NOT NULL,\n\
                 PRIMARY KEY (db, key)\n\
             ) WITHOUT ROWID;",
        )
        .map_err(sql_err)?;

        let byte_swapped = Self::check_byte_order(&conn)?;
        Ok(RelationalBackend {
            conn,
            handles: HashMap::new(),
            next_id: 0,
            in_txn: false,
            byte_swapped,
        })
    }

    fn configure(conn: &Connection, tuning: &Tuning) -> Result<()> {
        let synchronous = match tuning.durability {
            Durability::Standard => "NORMAL",
            Durability::Sync => "FULL",
        };
        // journal_mode returns a row; it cannot go through execute_batch.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(sql_err)?;
        conn.execute_batch(&format!(
            "PRAGMA synchronous = {};\n\
             PRAGMA cache_size = -{};",
            synchronous, tuning.cache_kb
        ))
        .map_err(sql_err)?;
        conn.busy_timeout(std::time::Duration::from_millis(0))
            .map_err(sql_err)?;
        Ok(())
    }

    /// SQLite's own format is endian-neutral; the marker records which
    /// byte order wrote the environment so callers can normalize their
    /// own value encodings.
    fn check_byte_order(conn: &Connection) -> Result<bool> {
        let existing: Option<Vec<u8>> = conn
            .query_row("SELECT v FROM meta WHERE k = 'byte_order'", [], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(sql_err(other)),
            })?;
        match existing {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.as_slice().try_into().map_err(|_| {
                    Error::Corruption("byte-order marker has the wrong length".to_string())
                })?;
                let marker = u32::from_ne_bytes(raw);
                if marker == BYTE_ORDER_TAG {
                    Ok(false)
                } else if marker.swap_bytes() == BYTE_ORDER_TAG {
                    Ok(true)
                } else {
                    Err(Error::Corruption(
                        "unrecognized byte-order marker".to_string(),
                    ))
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (k, v) VALUES ('byte_order', ?1)",
                    params![BYTE_ORDER_TAG.to_ne_bytes().as_slice()],
                )
                .map_err(sql_err)?;
                Ok(false)
            }
        }
    }

    pub(crate) fn recover(dir: &Path, tuning: &Tuning, catastrophic: bool) -> Result<()> {
        let path = dir.join(DATA_FILE);
        if !path.exists() {
            return Ok(());
        }
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(sql_err)?;
        Self::configure(&conn, tuning)?;

        let check = if catastrophic {
            "integrity_check"
        } else {
            "quick_check"
        };
        let verdict: String = conn
            .query_row(&format!("PRAGMA {}", check), [], |row| row.get(0))
            .map_err(sql_err)?;
        if verdict != "ok" {
            return Err(Error::Corruption(format!(
                "sqlite {} reported: {}",
                check, verdict
            )));
        }
        if catastrophic {
            // Full rebuild: rewrites every page and discards slack left
            // by whatever the crashed process was doing.
            conn.execute_batch("VACUUM").map_err(sql_err)?;
            debug!(target: "lexstore::backend", path = %path.display(), "sqlite vacuum complete");
        }
        checkpoint_wal(&conn, "TRUNCATE").map_err(sql_err)?;
        Ok(())
    }

    pub(crate) fn remove(dir: &Path, tuning: &Tuning) -> Result<()> {
        let path = dir.join(DATA_FILE);
        if path.exists() {
            // Validate before deleting so a wrong-directory mistake fails
            // loudly instead of destroying unrelated files.
            Self::recover(dir, tuning, false)?;
            std::fs::remove_file(&path)?;
        }
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", path.display(), suffix));
            if side.exists() {
                std::fs::remove_file(&side)?;
            }
        }
        Ok(())
    }

    fn handle(&self, id: HandleId) -> Result<&SqlHandle> {
        self.handles
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))
    }

    fn require_txn(&self) -> Result<()> {
        if self.in_txn {
            Ok(())
        } else {
            Err(Error::InvalidState(
                "data operation outside a transaction".to_string(),
            ))
        }
    }

    fn writable_handle(&self, id: HandleId) -> Result<&SqlHandle> {
        let handle = self.handle(id)?;
        if !handle.mode.is_writable() {
            return Err(Error::InvalidState(format!(
                "handle '{}' is read-only",
                handle.name
            )));
        }
        Ok(handle)
    }
}

impl Backend for RelationalBackend {
    fn open_handle(&mut self, name: &str, mode: OpenMode) -> Result<HandleOpened> {
        if name.is_empty() || name.contains('\0') {
            return Err(Error::Config(
                "database name must be non-empty and NUL-free".to_string(),
            ));
        }
        let meta_key = format!("db:{}", name);
        let existed: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM meta WHERE k = ?1",
                params![meta_key],
                |_| Ok(true),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(sql_err(other)),
            })?;
        if !existed {
            if !mode.is_writable() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("database '{}' does not exist", name),
                )));
            }
            self.conn
                .execute(
                    "INSERT INTO meta (k, v) VALUES (?1, x'01')",
                    params![meta_key],
                )
                .map_err(sql_err)?;
        }

        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.handles.insert(
            id,
            SqlHandle {
                name: name.to_string(),
                mode,
            },
        );
        Ok(HandleOpened {
            id,
            byte_swapped: self.byte_swapped,
            created: !existed,
        })
    }

    fn close_handle(&mut self, id: HandleId) -> Result<()> {
        self.handles
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(Error::InvalidState(
                "a transaction is already active".to_string(),
            ));
        }
        // IMMEDIATE takes the write lock up front. Another writer holding
        // it yields SQLITE_BUSY; a short randomized backoff rides out
        // writers that commit promptly.
        let mut rng = rand::thread_rng();
        let mut attempts = 0;
        loop {
            match self.conn.execute_batch("BEGIN IMMEDIATE") {
                Ok(()) => {
                    self.in_txn = true;
                    return Ok(());
                }
                Err(e) if is_busy(&e) && attempts < BUSY_RETRY_LIMIT => {
                    attempts += 1;
                    std::thread::sleep(std::time::Duration::from_millis(
                        rng.gen_range(1..=10),
                    ));
                }
                Err(e) => return Err(sql_err(e)),
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.require_txn()?;
        match self.conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.in_txn = false;
                Ok(())
            }
            Err(e) => {
                // A failed COMMIT leaves the transaction open unless
                // SQLite already rolled it back; either way, end it.
                let _ = self.conn.execute_batch("ROLLBACK");
                self.in_txn = false;
                if is_busy(&e) {
                    Err(Error::Conflict(e.to_string()))
                } else {
                    Err(sql_err(e))
                }
            }
        }
    }

    fn abort(&mut self) -> Result<()> {
        self.require_txn()?;
        self.in_txn = false;
        // Statement errors can auto-rollback, in which case this ROLLBACK
        // finds no transaction. The slot is dead either way.
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            debug!(target: "lexstore::backend", error = %e, "rollback was a no-op");
        }
        Ok(())
    }

    fn get(&mut self, id: HandleId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.require_txn()?;
        let name = self.handle(id)?.name.clone();
        self.conn
            .query_row(
                "SELECT value FROM kv WHERE db = ?1 AND key = ?2",
                params![name, key],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other if is_busy(&other) => Err(Error::Conflict(other.to_string())),
                other => Err(sql_err(other)),
            })
    }

    fn put(&mut self, id: HandleId, key: &[u8], value: &[u8]) -> Result<()> {
        self.require_txn()?;
        let name = self.writable_handle(id)?.name.clone();
        self.conn
            .execute(
                "INSERT INTO kv (db, key, value) VALUES (?1, ?2, ?3)\n\
                 ON CONFLICT (db, key) DO UPDATE SET value = excluded.value",
                params![name, key, value],
            )
            .map(|_| ())
            .map_err(|e| {
                if is_busy(&e) {
                    Error::Conflict(e.to_string())
                } else {
                    sql_err(e)
                }
            })
    }

    fn delete(&mut self, id: HandleId, key: &[u8]) -> Result<()> {
        self.require_txn()?;
        let name = self.writable_handle(id)?.name.clone();
        self.conn
            .execute(
                "DELETE FROM kv WHERE db = ?1 AND key = ?2",
                params![name, key],
            )
            .map(|_| ())
            .map_err(|e| {
                if is_busy(&e) {
                    Error::Conflict(e.to_string())
                } else {
                    sql_err(e)
                }
            })
    }

    fn for_each(&mut self, id: HandleId, visit: &mut KvVisitor<'_>) -> Result<()> {
        self.require_txn()?;
        let name = self.handle(id)?.name.clone();
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM kv WHERE db = ?1 ORDER BY key ASC")
            .map_err(sql_err)?;
        let mut rows = stmt.query(params![name]).map_err(sql_err)?;
        while let Some(row) = rows.next().map_err(sql_err)? {
            let key: Vec<u8> = row.get(0).map_err(sql_err)?;
            let value: Vec<u8> = row.get(1).map_err(sql_err)?;
            if let ControlFlow::Break(()) = visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn sync(&mut self, _id: HandleId) -> Result<()> {
        if self.in_txn {
            return Err(Error::InvalidState(
                "cannot checkpoint with a transaction in flight".to_string(),
            ));
        }
        checkpoint_wal(&self.conn, "FULL").map_err(sql_err)
    }

    fn flush_some(&mut self) -> Result<()> {
        if self.in_txn {
            return Ok(());
        }
        if let Err(e) = checkpoint_wal(&self.conn, "PASSIVE") {
            warn!(target: "lexstore::backend", error = %e, "passive checkpoint skipped");
        }
        Ok(())
    }

    fn checkpoint(&mut self) -> Result<()> {
        if self.in_txn {
            return Err(Error::InvalidState(
                "cannot checkpoint with a transaction in flight".to_string(),
            ));
        }
        checkpoint_wal(&self.conn, "TRUNCATE").map_err(sql_err)
    }

    fn purge_logs(&mut self) -> Result<()> {
        // WAL truncation is the relational engine's log removal.
        self.checkpoint()
    }

    fn close(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(Error::InvalidState(format!(
                "{} handle(s) still open",
                self.handles.len()
            )));
        }
        if self.in_txn {
            return Err(Error::InvalidState(
                "cannot close with a transaction in flight".to_string(),
            ));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "relational"
    }

    fn engine_version(&self) -> String {
        format!("sqlite {}", rusqlite::version())
    }
}
