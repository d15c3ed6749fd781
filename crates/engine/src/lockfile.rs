//! Crash detector and lock coordinator
//!
//! Processes sharing a database directory coordinate through one lock file
//! (fixed name, [`LOCK_FILE_NAME`]) using two independent advisory-lock
//! mechanisms:
//!
//! - A **directory-wide lock** ([`DirLock`], `flock`): shared during normal
//!   operation so cooperating processes proceed concurrently, exclusive
//!   only while recovery runs. `flock` locks belong to the open file
//!   description, so two handles within one process conflict like two
//!   processes do, which keeps the serialization logic testable in-process.
//! - **Per-process cells** ([`ProcessRegistry`], open-file-description
//!   `fcntl` byte ranges): each occupant claims one fixed-width slot,
//!   writes its pid into it, and holds a write lock on the slot's byte
//!   range for as long as the environment is open. The kernel releases the
//!   lock when the holding description closes, process death included; a
//!   slot whose pid bytes are present but whose range is unlocked is
//!   therefore the crash signal for the next opener. Clean shutdown zeroes
//!   the slot before unlocking.
//!
//! Cell locks use the OFD variants (`F_OFD_SETLK`/`F_OFD_GETLK`): they
//! belong to the open file description, not the process, so a probe
//! through a second descriptor sees a live cell held elsewhere in this
//! process, closing that second descriptor cannot take the live lock down
//! with it, and two registries in one process conflict on a slot exactly
//! like two processes do. `F_OFD_GETLK` queries without acquiring, so a
//! probe never converts or steals a lock. Each registry's claimed cell
//! lives and dies with that registry's own descriptor.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use lexstore_core::{Error, Result};
use tracing::{debug, warn};

/// Fixed relative name of the coordination lock file inside the
/// environment root.
pub const LOCK_FILE_NAME: &str = "lockfile";

/// Width of one process cell in bytes. The cell holds the occupant's pid
/// as ASCII decimal followed by a newline, NUL-padded.
const SLOT_SIZE: u64 = 32;

/// Cells start after one reserved slot. The reserved region is never
/// byte-range locked; the directory-wide `flock` covers the whole file
/// but lives in a different lock namespace.
const CELL_REGION_OFFSET: u64 = SLOT_SIZE;

/// Directory-wide lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Normal operation; many holders.
    Shared,
    /// Recovery only; sole holder.
    Exclusive,
}

fn lock_file_path(dir: &Path) -> PathBuf {
    dir.join(LOCK_FILE_NAME)
}

fn open_lock_file(dir: &Path) -> Result<File> {
    let path = lock_file_path(dir);
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(Error::from)
}

// ============================================================================
// Directory-wide lock
// ============================================================================

/// Directory-wide advisory lock guard.
///
/// Held shared for the lifetime of normal environment use, exclusive only
/// while recovery runs. Dropping the guard releases the lock.
pub struct DirLock {
    file: File,
    mode: LockMode,
}

impl DirLock {
    /// Take the directory-wide lock.
    ///
    /// With `wait = false` a busy lock yields `Ok(None)` instead of
    /// blocking. The lock file is created if absent.
    pub fn acquire(dir: &Path, mode: LockMode, wait: bool) -> Result<Option<DirLock>> {
        let file = open_lock_file(dir)?;
        let outcome = match (mode, wait) {
            (LockMode::Shared, true) => fs2::FileExt::lock_shared(&file).map(|()| true),
            (LockMode::Exclusive, true) => fs2::FileExt::lock_exclusive(&file).map(|()| true),
            (LockMode::Shared, false) => match fs2::FileExt::try_lock_shared(&file) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            },
            (LockMode::Exclusive, false) => match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            },
        };
        match outcome {
            Ok(true) => {
                debug!(target: "lexstore::lock", dir = %dir.display(), ?mode, "directory lock acquired");
                Ok(Some(DirLock { file, mode }))
            }
            Ok(false) => Ok(None),
            Err(e) => Err(Error::from(e)),
        }
    }

    /// Convert an exclusive lock to shared on the same descriptor.
    ///
    /// Used after recovery completes: the recovering process demotes to
    /// shared use without a release window another process could race
    /// through.
    pub fn downgrade(&mut self) -> Result<()> {
        if self.mode == LockMode::Shared {
            return Ok(());
        }
        fs2::FileExt::lock_shared(&self.file)?;
        self.mode = LockMode::Shared;
        Ok(())
    }

    /// Current lock mode.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // Closing the descriptor releases the flock; unlock explicitly so
        // the release is not deferred by a dup'd descriptor.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

// ============================================================================
// fcntl helpers
// ============================================================================

// l_pid must be zero for the OFD commands; mem::zeroed covers it.
fn flock_struct(typ: libc::c_int, start: u64, len: u64) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = typ as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

/// Try to take a write lock on a byte range. `Ok(false)` means another
/// open file description holds a conflicting lock.
fn range_try_lock(file: &File, start: u64, len: u64) -> io::Result<bool> {
    let mut fl = flock_struct(libc::F_WRLCK, start, len);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLK, &mut fl) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EACCES) | Some(libc::EAGAIN) => Ok(false),
        _ => Err(err),
    }
}

fn range_unlock(file: &File, start: u64, len: u64) -> io::Result<()> {
    let mut fl = flock_struct(libc::F_UNLCK, start, len);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLK, &mut fl) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Query whether a byte range is write-locked by some other open file
/// description, without acquiring anything. OFD probing reports locks
/// held through other descriptors of this same process too, so a live
/// cell never reads as stale just because the prober shares a pid with
/// its owner.
fn range_probe(file: &File, start: u64, len: u64) -> io::Result<bool> {
    let mut fl = flock_struct(libc::F_WRLCK, start, len);
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_GETLK, &mut fl) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(i32::from(fl.l_type) != libc::F_UNLCK)
}

// ============================================================================
// Process cells
// ============================================================================

fn slot_offset(index: u64) -> u64 {
    CELL_REGION_OFFSET + index * SLOT_SIZE
}

fn encode_slot(pid: u32) -> [u8; SLOT_SIZE as usize] {
    let mut buf = [0u8; SLOT_SIZE as usize];
    let text = format!("{}\n", pid);
    buf[..text.len()].copy_from_slice(text.as_bytes());
    buf
}

fn slot_is_free(buf: &[u8]) -> bool {
    buf[0] == 0
}

fn slot_pid(buf: &[u8]) -> Option<u32> {
    let end = buf.iter().position(|&b| b == b'\n')?;
    std::str::from_utf8(&buf[..end]).ok()?.parse().ok()
}

/// Per-process occupancy registry for one environment directory.
///
/// Owns the single descriptor through which all cell operations run.
/// Dropping the registry without [`ProcessRegistry::release`] leaves the
/// pid bytes in place while the OS releases the range lock — exactly the
/// state a killed process leaves behind, which is what makes drop-without-
/// release a faithful crash simulation in tests.
pub struct ProcessRegistry {
    file: File,
    dir: PathBuf,
    own_slot: Option<u64>,
}

impl ProcessRegistry {
    /// Open (creating if absent) the lock file for `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        let file = open_lock_file(dir)?;
        Ok(ProcessRegistry {
            file,
            dir: dir.to_path_buf(),
            own_slot: None,
        })
    }

    fn slot_count(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        if len <= CELL_REGION_OFFSET {
            return Ok(0);
        }
        Ok((len - CELL_REGION_OFFSET) / SLOT_SIZE)
    }

    fn read_slot(&self, index: u64) -> Result<[u8; SLOT_SIZE as usize]> {
        let mut buf = [0u8; SLOT_SIZE as usize];
        self.file.read_exact_at(&mut buf, slot_offset(index))?;
        Ok(buf)
    }

    fn write_slot(&self, index: u64, buf: &[u8; SLOT_SIZE as usize]) -> Result<()> {
        self.file.write_all_at(buf, slot_offset(index))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Register this process as an active occupant of the environment.
    ///
    /// Scans for a free or stale slot, takes its range lock, and writes
    /// our pid. The range lock is held until [`release`](Self::release)
    /// or process death. Failing to claim a cell fails the whole
    /// environment open.
    pub fn claim(&mut self) -> Result<()> {
        if self.own_slot.is_some() {
            return Err(Error::InvalidState(
                "process cell already claimed for this environment".to_string(),
            ));
        }
        let pid = std::process::id();
        let count = self.slot_count()?;
        for index in 0..count {
            let buf = self.read_slot(index)?;
            // A free slot, or a stale one left by a crashed occupant, is
            // claimable; a slot whose range lock is held by a live process
            // is not.
            if !range_try_lock(&self.file, slot_offset(index), SLOT_SIZE)? {
                continue;
            }
            if !slot_is_free(&buf) {
                debug!(
                    target: "lexstore::lock",
                    dir = %self.dir.display(),
                    slot = index,
                    stale_pid = ?slot_pid(&buf),
                    "reclaiming stale process cell"
                );
            }
            self.write_slot(index, &encode_slot(pid))?;
            self.own_slot = Some(index);
            debug!(target: "lexstore::lock", dir = %self.dir.display(), slot = index, pid, "process cell claimed");
            return Ok(());
        }
        // No claimable slot: extend the file by one.
        let index = count;
        self.file
            .set_len(slot_offset(index) + SLOT_SIZE)
            .map_err(Error::from)?;
        if !range_try_lock(&self.file, slot_offset(index), SLOT_SIZE)? {
            // Another process raced us onto the new slot; one retry on the
            // slot it could not have taken as well.
            return Err(Error::InvalidState(format!(
                "could not claim a process cell in {}",
                self.dir.display()
            )));
        }
        self.write_slot(index, &encode_slot(pid))?;
        self.own_slot = Some(index);
        debug!(target: "lexstore::lock", dir = %self.dir.display(), slot = index, pid, "process cell claimed (extended)");
        Ok(())
    }

    /// Deregister this process: zero the slot, then drop the range lock.
    ///
    /// Zeroing before unlocking means there is no window in which the slot
    /// reads as occupied-but-unlocked, which would look like a crash.
    pub fn release(&mut self) -> Result<()> {
        let Some(index) = self.own_slot.take() else {
            return Ok(());
        };
        self.write_slot(index, &[0u8; SLOT_SIZE as usize])?;
        range_unlock(&self.file, slot_offset(index), SLOT_SIZE)?;
        debug!(target: "lexstore::lock", dir = %self.dir.display(), slot = index, "process cell released");
        Ok(())
    }

    /// Did a previous occupant vanish without cleaning up?
    ///
    /// True if any slot other than our own holds pid bytes but no live
    /// range lock. A missing or empty lock file means a fresh directory
    /// and reads as clean.
    pub fn needs_recovery(&self) -> Result<bool> {
        let count = self.slot_count()?;
        for index in 0..count {
            if self.own_slot == Some(index) {
                continue;
            }
            let buf = self.read_slot(index)?;
            if slot_is_free(&buf) {
                continue;
            }
            if !range_probe(&self.file, slot_offset(index), SLOT_SIZE)? {
                debug!(
                    target: "lexstore::lock",
                    dir = %self.dir.display(),
                    slot = index,
                    dead_pid = ?slot_pid(&buf),
                    "stale process cell found; recovery needed"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Zero every stale cell. Called immediately after successful
    /// recovery, while the caller holds the exclusive directory lock.
    ///
    /// Returns the number of cells cleared.
    pub fn clear_stale_cells(&mut self) -> Result<usize> {
        let count = self.slot_count()?;
        let mut cleared = 0;
        for index in 0..count {
            if self.own_slot == Some(index) {
                continue;
            }
            let buf = self.read_slot(index)?;
            if slot_is_free(&buf) {
                continue;
            }
            if range_probe(&self.file, slot_offset(index), SLOT_SIZE)? {
                continue; // live occupant
            }
            if !range_try_lock(&self.file, slot_offset(index), SLOT_SIZE)? {
                continue; // claimed between probe and lock
            }
            self.write_slot(index, &[0u8; SLOT_SIZE as usize])?;
            range_unlock(&self.file, slot_offset(index), SLOT_SIZE)?;
            cleared += 1;
        }
        if cleared > 0 {
            warn!(
                target: "lexstore::lock",
                dir = %self.dir.display(),
                cleared,
                "cleared stale process cells after recovery"
            );
        }
        Ok(cleared)
    }
}

/// Convenience probe used before an environment exists.
///
/// A directory without a lock file has never been occupied and is clean.
pub fn needs_recovery(dir: &Path) -> Result<bool> {
    if !lock_file_path(dir).exists() {
        return Ok(false);
    }
    ProcessRegistry::open(dir)?.needs_recovery()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_directory_is_clean() {
        let tmp = TempDir::new().unwrap();
        assert!(!needs_recovery(tmp.path()).unwrap());
    }

    #[test]
    fn test_claim_release_leaves_clean() {
        let tmp = TempDir::new().unwrap();
        let mut reg = ProcessRegistry::open(tmp.path()).unwrap();
        reg.claim().unwrap();
        reg.release().unwrap();
        drop(reg);
        assert!(!needs_recovery(tmp.path()).unwrap());
    }

    #[test]
    fn test_drop_without_release_signals_crash() {
        let tmp = TempDir::new().unwrap();
        let mut reg = ProcessRegistry::open(tmp.path()).unwrap();
        reg.claim().unwrap();
        // Simulated crash: the descriptor closes (OS releases the range
        // lock) but the pid bytes stay behind.
        drop(reg);
        assert!(needs_recovery(tmp.path()).unwrap());
    }

    #[test]
    fn test_clear_stale_cells_clears_crash_marker() {
        let tmp = TempDir::new().unwrap();
        let mut reg = ProcessRegistry::open(tmp.path()).unwrap();
        reg.claim().unwrap();
        drop(reg);

        let mut next = ProcessRegistry::open(tmp.path()).unwrap();
        assert!(next.needs_recovery().unwrap());
        assert_eq!(next.clear_stale_cells().unwrap(), 1);
        assert!(!next.needs_recovery().unwrap());
    }

    #[test]
    fn test_live_cell_visible_to_fresh_probe() {
        let tmp = TempDir::new().unwrap();
        let mut reg = ProcessRegistry::open(tmp.path()).unwrap();
        reg.claim().unwrap();

        // A separate descriptor in the same process must see the live
        // range lock and report the directory clean.
        assert!(!needs_recovery(tmp.path()).unwrap());
        // And the probe descriptor closing must not have taken the live
        // cell's lock down with it.
        assert!(!needs_recovery(tmp.path()).unwrap());

        // A second registry cannot steal the occupied slot either; it
        // extends the file instead.
        let mut second = ProcessRegistry::open(tmp.path()).unwrap();
        second.claim().unwrap();
        assert_eq!(second.slot_count().unwrap(), 2);
        second.release().unwrap();

        reg.release().unwrap();
        assert!(!needs_recovery(tmp.path()).unwrap());
    }

    #[test]
    fn test_own_cell_is_not_stale() {
        let tmp = TempDir::new().unwrap();
        let mut reg = ProcessRegistry::open(tmp.path()).unwrap();
        reg.claim().unwrap();
        // Our own claimed slot must not read as a crash.
        assert!(!reg.needs_recovery().unwrap());
        reg.release().unwrap();
    }

    #[test]
    fn test_stale_slot_is_reclaimed() {
        let tmp = TempDir::new().unwrap();
        let mut reg = ProcessRegistry::open(tmp.path()).unwrap();
        reg.claim().unwrap();
        drop(reg);

        let mut next = ProcessRegistry::open(tmp.path()).unwrap();
        next.claim().unwrap();
        // The stale slot was reused rather than the file growing.
        assert_eq!(next.slot_count().unwrap(), 1);
        next.release().unwrap();
    }

    #[test]
    fn test_exclusive_dir_lock_excludes() {
        let tmp = TempDir::new().unwrap();
        let held = DirLock::acquire(tmp.path(), LockMode::Exclusive, true)
            .unwrap()
            .unwrap();
        // flock is per open file description: a second acquisition in the
        // same process conflicts just like another process would.
        let busy = DirLock::acquire(tmp.path(), LockMode::Exclusive, false).unwrap();
        assert!(busy.is_none());
        let busy_shared = DirLock::acquire(tmp.path(), LockMode::Shared, false).unwrap();
        assert!(busy_shared.is_none());
        drop(held);
        let now_free = DirLock::acquire(tmp.path(), LockMode::Exclusive, false).unwrap();
        assert!(now_free.is_some());
    }

    #[test]
    fn test_shared_dir_locks_coexist() {
        let tmp = TempDir::new().unwrap();
        let a = DirLock::acquire(tmp.path(), LockMode::Shared, true)
            .unwrap()
            .unwrap();
        let b = DirLock::acquire(tmp.path(), LockMode::Shared, false).unwrap();
        assert!(b.is_some());
        // But an exclusive attempt is refused while readers hold it.
        let excl = DirLock::acquire(tmp.path(), LockMode::Exclusive, false).unwrap();
        assert!(excl.is_none());
        drop(a);
        drop(b);
    }

    #[test]
    fn test_downgrade_admits_readers() {
        let tmp = TempDir::new().unwrap();
        let mut held = DirLock::acquire(tmp.path(), LockMode::Exclusive, true)
            .unwrap()
            .unwrap();
        held.downgrade().unwrap();
        assert_eq!(held.mode(), LockMode::Shared);
        let reader = DirLock::acquire(tmp.path(), LockMode::Shared, false).unwrap();
        assert!(reader.is_some());
    }

    #[test]
    fn test_slot_encoding_round_trip() {
        let buf = encode_slot(4242);
        assert!(!slot_is_free(&buf));
        assert_eq!(slot_pid(&buf), Some(4242));
        assert!(slot_is_free(&[0u8; SLOT_SIZE as usize]));
    }
}
