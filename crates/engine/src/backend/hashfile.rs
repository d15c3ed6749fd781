//! Single-file hash backend
//!
//! A log-structured single-file engine in the spirit of the classic
//! single-file hash databases: one data file per handle, an in-memory
//! index rebuilt by a forward scan at open, append-only writes, tombstones
//! for deletes, and a live-record rewrite (reorganization) at close once
//! dead bytes pass a fill-ratio threshold.
//!
//! File layout:
//!
//! ```text
//! header:  magic [4] | byte-order marker u32 (native) | format version u32 (LE)
//! record:  crc32 u32 | key_len u32 | val_len u32 | key | value      (all LE)
//! ```
//!
//! `val_len == u32::MAX` marks a tombstone. The CRC covers the two length
//! words and the payload; a torn tail record (crash mid-append) fails the
//! CRC or runs past end-of-file and is truncated away during the open
//! scan. No shared environment, no transactions; one whole-file advisory
//! lock per opened file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use lexstore_core::{Error, OpenMode, Result, Tuning};
use tracing::{debug, warn};

use super::{Backend, HandleId, HandleOpened, KvVisitor};

const MAGIC: [u8; 4] = *b"LEXH";
const FORMAT_VERSION: u32 = 1;
const BYTE_ORDER_TAG: u32 = 0x0102_0304;
const HEADER_LEN: u64 = 12;
const TOMBSTONE: u32 = u32::MAX;
const RECORD_HEADER_LEN: u64 = 12;

/// Rewrite live records at close once this fraction of the file is dead.
const REORG_THRESHOLD: f64 = 0.5;

fn file_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lex", name))
}

struct IndexEntry {
    /// Offset of the record header.
    offset: u64,
    value_len: u32,
}

struct HashHandle {
    file: File,
    path: PathBuf,
    name: String,
    mode: OpenMode,
    index: HashMap<Vec<u8>, IndexEntry>,
    /// Bytes occupied by superseded records and tombstones.
    dead_bytes: u64,
    /// Current end of file (next append offset).
    tail: u64,
    sync_writes: bool,
}

fn record_len(key_len: u32, value_len: u32) -> u64 {
    let value = if value_len == TOMBSTONE { 0 } else { value_len };
    RECORD_HEADER_LEN + key_len as u64 + value as u64
}

fn record_crc(key_len: u32, value_len: u32, key: &[u8], value: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key_len.to_le_bytes());
    hasher.update(&value_len.to_le_bytes());
    hasher.update(key);
    hasher.update(value);
    hasher.finalize()
}

impl HashHandle {
    fn open(dir: &Path, name: &str, mode: OpenMode, sync_writes: bool) -> Result<(Self, bool, bool)> {
        let path = file_path(dir, name);
        let existed = path.exists();
        if !existed && !mode.is_writable() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("database '{}' does not exist", name),
            )));
        }
        let mut file = OpenOptions::new()
            .create(mode.is_writable())
            .truncate(false)
            .read(true)
            .write(mode.is_writable())
            .open(&path)?;

        let locked = match mode {
            OpenMode::ReadOnly => fs2::FileExt::try_lock_shared(&file),
            OpenMode::ReadWrite => fs2::FileExt::try_lock_exclusive(&file),
        };
        match locked {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(Error::Busy(format!(
                    "database '{}' is locked by another process",
                    name
                )))
            }
            Err(e) => return Err(Error::from(e)),
        }

        let byte_swapped = if existed {
            let mut header = [0u8; HEADER_LEN as usize];
            file.read_exact(&mut header).map_err(|_| {
                Error::Corruption(format!("'{}': truncated file header", name))
            })?;
            if header[..4] != MAGIC {
                return Err(Error::Corruption(format!(
                    "'{}' is not a hash database (bad magic)",
                    name
                )));
            }
            let marker = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
            if marker != BYTE_ORDER_TAG && marker.swap_bytes() != BYTE_ORDER_TAG {
                return Err(Error::Corruption(format!(
                    "'{}': unrecognized byte-order marker",
                    name
                )));
            }
            marker != BYTE_ORDER_TAG
        } else {
            file.write_all(&MAGIC)?;
            file.write_all(&BYTE_ORDER_TAG.to_ne_bytes())?;
            file.write_u32::<LittleEndian>(FORMAT_VERSION)?;
            file.sync_data()?;
            false
        };

        let mut handle = HashHandle {
            file,
            path,
            name: name.to_string(),
            mode,
            index: HashMap::new(),
            dead_bytes: 0,
            tail: HEADER_LEN,
            sync_writes,
        };
        handle.rebuild_index()?;
        Ok((handle, byte_swapped, !existed))
    }

    /// Forward scan: rebuild the in-memory index and truncate any torn
    /// record left by a crash mid-append.
    fn rebuild_index(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut offset = HEADER_LEN;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut reader = io::BufReader::new(&self.file);

        while offset < file_len {
            if file_len - offset < RECORD_HEADER_LEN {
                break; // torn header
            }
            let crc = reader.read_u32::<LittleEndian>()?;
            let key_len = reader.read_u32::<LittleEndian>()?;
            let value_len = reader.read_u32::<LittleEndian>()?;
            let this_len = record_len(key_len, value_len);
            if offset + this_len > file_len {
                break; // torn payload
            }
            let mut key = vec![0u8; key_len as usize];
            reader.read_exact(&mut key)?;
            let mut value = vec![0u8; if value_len == TOMBSTONE { 0 } else { value_len as usize }];
            reader.read_exact(&mut value)?;
            if record_crc(key_len, value_len, &key, &value) != crc {
                break; // torn or corrupt tail
            }

            if let Some(old) = self.index.remove(&key) {
                self.dead_bytes += record_len(old_key_len(&key), old.value_len);
            }
            if value_len == TOMBSTONE {
                self.dead_bytes += this_len;
            } else {
                self.index.insert(
                    key,
                    IndexEntry {
                        offset,
                        value_len,
                    },
                );
            }
            offset += this_len;
        }

        if offset < file_len {
            warn!(
                target: "lexstore::backend",
                name = %self.name,
                discarded = file_len - offset,
                "truncating torn tail record"
            );
            if self.mode.is_writable() {
                self.file.set_len(offset)?;
            }
        }
        self.tail = offset;
        Ok(())
    }

    fn read_value(&mut self, entry_offset: u64) -> Result<Vec<u8>> {
        self.file.seek(SeekFrom::Start(entry_offset + 4))?;
        let key_len = self.file.read_u32::<LittleEndian>()?;
        let value_len = self.file.read_u32::<LittleEndian>()?;
        if value_len == TOMBSTONE {
            return Err(Error::Corruption(format!(
                "'{}': index points at a tombstone",
                self.name
            )));
        }
        self.file.seek(SeekFrom::Current(key_len as i64))?;
        let mut value = vec![0u8; value_len as usize];
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    fn append(&mut self, key: &[u8], value: &[u8], tombstone: bool) -> Result<u64> {
        let key_len = key.len() as u32;
        let value_len = if tombstone { TOMBSTONE } else { value.len() as u32 };
        let crc = record_crc(key_len, value_len, key, value);
        let offset = self.tail;

        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::with_capacity((RECORD_HEADER_LEN as usize) + key.len() + value.len());
        buf.write_u32::<LittleEndian>(crc)?;
        buf.write_u32::<LittleEndian>(key_len)?;
        buf.write_u32::<LittleEndian>(value_len)?;
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        self.file.write_all(&buf)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        self.tail = offset + buf.len() as u64;
        Ok(offset)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let offset = self.append(key, value, false)?;
        if let Some(old) = self.index.insert(
            key.to_vec(),
            IndexEntry {
                offset,
                value_len: value.len() as u32,
            },
        ) {
            self.dead_bytes += record_len(key.len() as u32, old.value_len);
        }
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        if let Some(old) = self.index.remove(key) {
            self.append(key, b"", true)?;
            self.dead_bytes += record_len(key.len() as u32, old.value_len);
            self.dead_bytes += record_len(key.len() as u32, TOMBSTONE);
        }
        Ok(())
    }

    /// Rewrite live records into a fresh file and atomically swap it in.
    fn reorganize(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("lex.reorg");
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;
        // Lock the replacement before the rename makes it visible.
        fs2::FileExt::lock_exclusive(&tmp)?;
        tmp.write_all(&MAGIC)?;
        tmp.write_all(&BYTE_ORDER_TAG.to_ne_bytes())?;
        tmp.write_u32::<LittleEndian>(FORMAT_VERSION)?;

        let keys: Vec<Vec<u8>> = self.index.keys().cloned().collect();
        let mut new_index = HashMap::with_capacity(keys.len());
        let mut tail = HEADER_LEN;
        for key in keys {
            let entry_offset = self.index[&key].offset;
            let value = self.read_value(entry_offset)?;
            let key_len = key.len() as u32;
            let value_len = value.len() as u32;
            let crc = record_crc(key_len, value_len, &key, &value);
            tmp.write_u32::<LittleEndian>(crc)?;
            tmp.write_u32::<LittleEndian>(key_len)?;
            tmp.write_u32::<LittleEndian>(value_len)?;
            tmp.write_all(&key)?;
            tmp.write_all(&value)?;
            new_index.insert(
                key,
                IndexEntry {
                    offset: tail,
                    value_len,
                },
            );
            tail += record_len(key_len, value_len);
        }
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(
            target: "lexstore::backend",
            name = %self.name,
            reclaimed = self.dead_bytes,
            "hash file reorganized"
        );
        self.file = tmp;
        self.index = new_index;
        self.dead_bytes = 0;
        self.tail = tail;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.mode.is_writable() {
            let total = self.tail.saturating_sub(HEADER_LEN);
            if total > 0 && (self.dead_bytes as f64) / (total as f64) > REORG_THRESHOLD {
                self.reorganize()?;
            }
            self.file.sync_all()?;
        }
        Ok(())
    }
}

// Key length is the map key's own length; helper keeps the accounting
// call sites readable.
fn old_key_len(key: &[u8]) -> u32 {
    key.len() as u32
}

/// Single-file hash engine: no shared environment, no transactions.
pub(crate) struct HashFileBackend {
    dir: PathBuf,
    sync_writes: bool,
    handles: HashMap<HandleId, HashHandle>,
    next_id: u32,
}

impl HashFileBackend {
    pub(crate) fn open(dir: &Path, tuning: &Tuning) -> Result<Self> {
        Ok(HashFileBackend {
            dir: dir.to_path_buf(),
            sync_writes: tuning.durability == lexstore_core::Durability::Sync,
            handles: HashMap::new(),
            next_id: 0,
        })
    }

    /// Open-and-scan validates every file; the scan already truncates torn
    /// tails, which is the whole of recovery for a log-structured file.
    pub(crate) fn recover(dir: &Path, _tuning: &Tuning, _catastrophic: bool) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                // A crash mid-reorganization leaves a half-written
                // rewrite behind; the original file is still intact.
                Some("reorg") => {
                    std::fs::remove_file(&path)?;
                    continue;
                }
                Some("lex") => {}
                _ => continue,
            }
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("")
                .to_string();
            let (mut handle, _, _) =
                HashHandle::open(dir, &name, OpenMode::ReadWrite, false)?;
            handle.close()?;
        }
        Ok(())
    }

    pub(crate) fn remove(dir: &Path) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("lex") | Some("reorg")) {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn handle_mut(&mut self, id: HandleId) -> Result<&mut HashHandle> {
        self.handles
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))
    }
}

impl Backend for HashFileBackend {
    fn open_handle(&mut self, name: &str, mode: OpenMode) -> Result<HandleOpened> {
        if name.is_empty() {
            return Err(Error::Config("database name must be non-empty".to_string()));
        }
        let (handle, byte_swapped, created) =
            HashHandle::open(&self.dir, name, mode, self.sync_writes)?;
        let id = HandleId(self.next_id);
        self.next_id += 1;
        self.handles.insert(id, handle);
        Ok(HandleOpened {
            id,
            byte_swapped,
            created,
        })
    }

    fn close_handle(&mut self, id: HandleId) -> Result<()> {
        let mut handle = self
            .handles
            .remove(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown handle {:?}", id)))?;
        handle.close()
    }

    fn get(&mut self, id: HandleId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.handle_mut(id)?;
        match handle.index.get(key) {
            Some(entry) => {
                let offset = entry.offset;
                Ok(Some(handle.read_value(offset)?))
            }
            None => Ok(None),
        }
    }

    fn put(&mut self, id: HandleId, key: &[u8], value: &[u8]) -> Result<()> {
        let handle = self.handle_mut(id)?;
        if !handle.mode.is_writable() {
            return Err(Error::InvalidState(format!(
                "handle '{}' is read-only",
                handle.name
            )));
        }
        handle.put(key, value)
    }

    fn delete(&mut self, id: HandleId, key: &[u8]) -> Result<()> {
        let handle = self.handle_mut(id)?;
        if !handle.mode.is_writable() {
            return Err(Error::InvalidState(format!(
                "handle '{}' is read-only",
                handle.name
            )));
        }
        handle.delete(key)
    }

    fn for_each(&mut self, id: HandleId, visit: &mut KvVisitor<'_>) -> Result<()> {
        let handle = self.handle_mut(id)?;
        // Hash order is the engine-defined order for this variant. Values
        // are materialized up front so the visitor never observes the file
        // cursor mid-read.
        let entries: Vec<(Vec<u8>, u64)> = handle
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.offset))
            .collect();
        for (key, offset) in entries {
            let value = handle.read_value(offset)?;
            if let ControlFlow::Break(()) = visit(&key, &value) {
                break;
            }
        }
        Ok(())
    }

    fn sync(&mut self, id: HandleId) -> Result<()> {
        let handle = self.handle_mut(id)?;
        handle.file.sync_all().map_err(Error::from)
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
        "hashfile"
    }

    fn engine_version(&self) -> String {
        format!("hashfile (format v{})", FORMAT_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_backend(dir: &Path) -> HashFileBackend {
        HashFileBackend::open(dir, &Tuning::for_testing()).unwrap()
    }

    #[test]
    fn test_round_trip_and_delete() {
        let tmp = TempDir::new().unwrap();
        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert!(h.created);

        backend.put(h.id, b"token", b"\x05\x00").unwrap();
        assert_eq!(
            backend.get(h.id, b"token").unwrap(),
            Some(b"\x05\x00".to_vec())
        );
        backend.delete(h.id, b"token").unwrap();
        assert_eq!(backend.get(h.id, b"token").unwrap(), None);
        // Deleting an absent key is success.
        backend.delete(h.id, b"never-written").unwrap();
        backend.close_handle(h.id).unwrap();
    }

    #[test]
    fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend = open_backend(tmp.path());
            let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
            backend.put(h.id, b"a", b"1").unwrap();
            backend.put(h.id, b"b", b"2").unwrap();
            backend.put(h.id, b"a", b"3").unwrap(); // supersede
            backend.delete(h.id, b"b").unwrap();
            backend.close_handle(h.id).unwrap();
        }
        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert!(!h.created);
        assert_eq!(backend.get(h.id, b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(backend.get(h.id, b"b").unwrap(), None);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend = open_backend(tmp.path());
            let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
            backend.put(h.id, b"good", b"value").unwrap();
            backend.close_handle(h.id).unwrap();
        }
        // Simulate a crash mid-append: garbage half-record at the tail.
        let path = file_path(tmp.path(), "words");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE, 0xEF, 0x09]).unwrap();
        drop(file);

        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert_eq!(backend.get(h.id, b"good").unwrap(), Some(b"value".to_vec()));
        // The torn bytes are gone; a fresh write lands cleanly.
        backend.put(h.id, b"next", b"ok").unwrap();
        backend.close_handle(h.id).unwrap();

        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert_eq!(backend.get(h.id, b"next").unwrap(), Some(b"ok".to_vec()));
    }

    #[test]
    fn test_recover_discards_interrupted_rewrite() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend = open_backend(tmp.path());
            let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
            backend.put(h.id, b"k", b"v").unwrap();
            backend.close_handle(h.id).unwrap();
        }
        // A crash during reorganization: the half-written rewrite exists
        // next to the untouched original.
        let stray = tmp.path().join("words.lex.reorg");
        std::fs::write(&stray, b"half-written").unwrap();

        HashFileBackend::recover(tmp.path(), &Tuning::for_testing(), false).unwrap();
        assert!(!stray.exists());

        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert_eq!(backend.get(h.id, b"k").unwrap(), Some(b"v".to_vec()));
        backend.close_handle(h.id).unwrap();
    }

    #[test]
    fn test_remove_deletes_stray_rewrites() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend = open_backend(tmp.path());
            let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
            backend.put(h.id, b"k", b"v").unwrap();
            backend.close_handle(h.id).unwrap();
        }
        let stray = tmp.path().join("words.lex.reorg");
        std::fs::write(&stray, b"half-written").unwrap();

        HashFileBackend::remove(tmp.path()).unwrap();
        assert!(!stray.exists());
        assert!(!file_path(tmp.path(), "words").exists());
    }

    #[test]
    fn test_reorganization_reclaims_dead_space() {
        let tmp = TempDir::new().unwrap();
        {
            let mut backend = open_backend(tmp.path());
            let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
            // Mostly superseded records: well past the fill threshold.
            for round in 0..10u8 {
                backend.put(h.id, b"churn", &[round; 64]).unwrap();
            }
            backend.put(h.id, b"keep", b"kept").unwrap();
            backend.close_handle(h.id).unwrap();
        }
        let after_close = std::fs::metadata(file_path(tmp.path(), "words"))
            .unwrap()
            .len();
        // One live churn record + one keep record + header.
        assert!(after_close < 64 * 3);

        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert_eq!(backend.get(h.id, b"keep").unwrap(), Some(b"kept".to_vec()));
        assert_eq!(
            backend.get(h.id, b"churn").unwrap(),
            Some(vec![9u8; 64])
        );
    }

    #[test]
    fn test_foreign_byte_order_is_reported() {
        let tmp = TempDir::new().unwrap();
        // Stamp a header the way an opposite-endian machine would.
        let path = file_path(tmp.path(), "words");
        let mut file = File::create(&path).unwrap();
        file.write_all(&MAGIC).unwrap();
        file.write_all(&BYTE_ORDER_TAG.swap_bytes().to_ne_bytes())
            .unwrap();
        file.write_u32::<LittleEndian>(FORMAT_VERSION).unwrap();
        drop(file);

        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        assert!(h.byte_swapped);
        assert!(!h.created);
        backend.close_handle(h.id).unwrap();
    }

    #[test]
    fn test_iterate_visits_each_live_pair_once() {
        let tmp = TempDir::new().unwrap();
        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        for i in 0..20u8 {
            backend.put(h.id, &[i], &[i, i]).unwrap();
        }
        backend.delete(h.id, &[7]).unwrap();

        let mut seen = std::collections::HashMap::new();
        backend
            .for_each(h.id, &mut |k, v| {
                assert!(seen.insert(k.to_vec(), v.to_vec()).is_none());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen.len(), 19);
        assert_eq!(seen.get([3u8].as_slice()), Some(&vec![3u8, 3]));
        assert!(!seen.contains_key([7u8].as_slice()));
    }

    #[test]
    fn test_early_stop() {
        let tmp = TempDir::new().unwrap();
        let mut backend = open_backend(tmp.path());
        let h = backend.open_handle("words", OpenMode::ReadWrite).unwrap();
        for i in 0..10u8 {
            backend.put(h.id, &[i], b"x").unwrap();
        }
        let mut visited = 0;
        backend
            .for_each(h.id, &mut |_, _| {
                visited += 1;
                if visited == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(visited, 3);
    }
}
