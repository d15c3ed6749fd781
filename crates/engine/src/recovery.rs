//! Maintenance entry points: recovery, log purging, removal
//!
//! These run against a closed environment directory. Each one takes the
//! exclusive directory lock first, so they serialize against every
//! process that has the environment open (open holds the shared lock)
//! and against each other. None of them may run from a process that
//! currently has the same directory open: that process already holds the
//! shared directory lock, so its own exclusive acquisition could only
//! deadlock against it.

use std::path::Path;

use lexstore_core::{BackendKind, Error, Result, Tuning};
use rand::Rng;
use tracing::{info, warn};

use crate::backend;
use crate::environment;
use crate::lockfile::{DirLock, LockMode, ProcessRegistry, LOCK_FILE_NAME};

const LOCK_RETRY_LIMIT: u32 = 50;

fn guard_not_open_locally(dir: &Path) -> Result<()> {
    if environment::is_open_in_process(dir) {
        return Err(Error::InvalidState(format!(
            "'{}' is open in this process; close it before maintenance",
            dir.display()
        )));
    }
    Ok(())
}

/// Take the exclusive directory lock, backing off while readers drain.
///
/// Contenders sleep a randomized interval so two recovering processes do
/// not retry in lockstep. After the retry budget the final attempt
/// blocks.
fn acquire_exclusive(dir: &Path) -> Result<DirLock> {
    let mut rng = rand::thread_rng();
    for _ in 0..LOCK_RETRY_LIMIT {
        if let Some(lock) = DirLock::acquire(dir, LockMode::Exclusive, false)? {
            return Ok(lock);
        }
        std::thread::sleep(std::time::Duration::from_millis(rng.gen_range(10..=100)));
    }
    match DirLock::acquire(dir, LockMode::Exclusive, true)? {
        Some(lock) => Ok(lock),
        None => Err(Error::Busy(format!(
            "could not take exclusive lock on '{}'",
            dir.display()
        ))),
    }
}

/// Run crash recovery on the environment under `dir`.
///
/// With `force` unset this is a no-op when no crashed process is
/// recorded, which makes the call safe to race: whichever process wins
/// the exclusive lock does the work and the rest find a clean directory.
/// `catastrophic` goes straight to the engine's full verify-and-rebuild
/// mode; otherwise standard recovery runs first and escalates once if it
/// fails.
pub fn recover(
    dir: &Path,
    kind: BackendKind,
    tuning: &Tuning,
    catastrophic: bool,
    force: bool,
) -> Result<()> {
    let dir = dir.canonicalize()?;
    guard_not_open_locally(&dir)?;
    tuning.validate()?;

    let _lock = acquire_exclusive(&dir)?;
    let mut registry = ProcessRegistry::open(&dir)?;
    if !force && !registry.needs_recovery()? {
        info!(
            target: "lexstore::recovery",
            dir = %dir.display(),
            "no crashed process recorded, nothing to do"
        );
        return Ok(());
    }

    info!(
        target: "lexstore::recovery",
        dir = %dir.display(),
        engine = kind.as_str(),
        catastrophic,
        "running recovery"
    );
    let outcome = if catastrophic {
        backend::recover_with(kind, &dir, tuning, true)
    } else {
        backend::recover_with(kind, &dir, tuning, false).or_else(|e| {
            warn!(
                target: "lexstore::recovery",
                error = %e,
                "standard recovery failed, escalating to catastrophic"
            );
            backend::recover_with(kind, &dir, tuning, true)
        })
    };
    match outcome {
        Ok(()) => {
            let cleared = registry.clear_stale_cells()?;
            info!(
                target: "lexstore::recovery",
                dir = %dir.display(),
                cleared,
                "recovery complete"
            );
            Ok(())
        }
        Err(e) => Err(Error::RecoveryFailed {
            dir: dir.clone(),
            message: format!(
                "{}; remove the environment and rebuild it from source data",
                e
            ),
        }),
    }
}

/// Checkpoint the engine and delete any log state it no longer needs.
pub fn purge_logs(dir: &Path, kind: BackendKind, tuning: &Tuning) -> Result<()> {
    let dir = dir.canonicalize()?;
    guard_not_open_locally(&dir)?;
    tuning.validate()?;

    let _lock = acquire_exclusive(&dir)?;
    if ProcessRegistry::open(&dir)?.needs_recovery()? {
        return Err(Error::InvalidState(format!(
            "'{}' needs recovery before its logs can be purged",
            dir.display()
        )));
    }
    let mut engine = backend::open_backend(kind, &dir, tuning)?;
    engine.checkpoint()?;
    engine.purge_logs()?;
    engine.close()?;
    info!(target: "lexstore::recovery", dir = %dir.display(), "logs purged");
    Ok(())
}

/// Validate and delete the environment's bookkeeping under `dir`.
///
/// Data files are verified (and repaired if needed) before anything is
/// deleted, so a typo'd path fails instead of destroying files. The
/// directory itself is left in place.
pub fn remove(dir: &Path, kind: BackendKind, tuning: &Tuning) -> Result<()> {
    let dir = dir.canonicalize()?;
    guard_not_open_locally(&dir)?;
    tuning.validate()?;

    let lock = acquire_exclusive(&dir)?;
    backend::recover_with(kind, &dir, tuning, false)?;
    backend::remove_with(kind, &dir, tuning)?;
    let lock_path = dir.join(LOCK_FILE_NAME);
    if lock_path.exists() {
        std::fs::remove_file(&lock_path)?;
    }
    drop(lock);
    info!(target: "lexstore::recovery", dir = %dir.display(), "environment removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockfile;
    use tempfile::TempDir;

    fn tuning() -> Tuning {
        Tuning::for_testing()
    }

    #[test]
    fn test_recover_on_clean_directory_is_noop() {
        let tmp = TempDir::new().unwrap();
        recover(
            tmp.path(),
            BackendKind::SingleFileHash,
            &tuning(),
            false,
            false,
        )
        .unwrap();
        assert!(!lockfile::needs_recovery(tmp.path()).unwrap());
    }

    #[test]
    fn test_recover_clears_crash_marker() {
        let tmp = TempDir::new().unwrap();
        {
            // Claim a cell and drop the registry without releasing: the
            // on-disk pid slot stays while its lock evaporates, exactly
            // what a killed process leaves behind.
            let mut registry = ProcessRegistry::open(tmp.path()).unwrap();
            registry.claim().unwrap();
        }
        assert!(lockfile::needs_recovery(tmp.path()).unwrap());

        recover(
            tmp.path(),
            BackendKind::SingleFileHash,
            &tuning(),
            false,
            false,
        )
        .unwrap();
        assert!(!lockfile::needs_recovery(tmp.path()).unwrap());
    }

    #[test]
    fn test_forced_recovery_runs_on_clean_directory() {
        let tmp = TempDir::new().unwrap();
        recover(
            tmp.path(),
            BackendKind::SingleFileHash,
            &tuning(),
            false,
            true,
        )
        .unwrap();
    }

    #[test]
    fn test_remove_deletes_bookkeeping() {
        let tmp = TempDir::new().unwrap();
        {
            let mut registry = ProcessRegistry::open(tmp.path()).unwrap();
            registry.claim().unwrap();
            registry.release().unwrap();
        }
        remove(tmp.path(), BackendKind::SingleFileHash, &tuning()).unwrap();
        assert!(!tmp.path().join(LOCK_FILE_NAME).exists());
        // The directory survives.
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_purge_refused_when_recovery_pending() {
        let tmp = TempDir::new().unwrap();
        {
            let mut registry = ProcessRegistry::open(tmp.path()).unwrap();
            registry.claim().unwrap();
        }
        let err = purge_logs(tmp.path(), BackendKind::SingleFileHash, &tuning()).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
