//! Advisory lock files and completion markers for backup destinations.
//!
//! Every replica `foo.db` is guarded by a sibling `foo.db.lock` while a pass
//! runs and summarised by `foo.db.completed` when one finishes. Locks are
//! acquired non-blocking with `create_new`, carry the owning PID and a
//! timestamp, and are removed on every exit path via the guard's `Drop`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("backup lock already held: {0}")]
    Held(PathBuf),

    #[error("could not create lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// `foo.db` → `foo.db.lock`
pub fn lock_path(backup_path: &Path) -> PathBuf {
    sibling_with_suffix(backup_path, ".lock")
}

/// `foo.db` → `foo.db.completed`
pub fn completion_path(backup_path: &Path) -> PathBuf {
    sibling_with_suffix(backup_path, ".completed")
}

/// `foo.db` → `foo.txt` (the DAM tab-separated append log).
pub fn dam_path(backup_path: &Path) -> PathBuf {
    backup_path.with_extension("txt")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Exclusive advisory lock on a backup destination.
///
/// Dropping the guard deletes the lock file, so a pass that fails anywhere
/// still releases the destination.
#[derive(Debug)]
pub struct BackupLock {
    path: PathBuf,
}

impl BackupLock {
    /// Non-blocking acquisition. Fails with [`LockError::Held`] when another
    /// process (or job) owns the destination.
    pub fn acquire(backup_path: &Path) -> Result<Self, LockError> {
        if let Some(parent) = backup_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let path = lock_path(backup_path);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held(path));
            }
            Err(err) => return Err(err.into()),
        };
        writeln!(file, "PID: {}", std::process::id())?;
        writeln!(file, "Timestamp: {}", Utc::now().to_rfc3339())?;
        Ok(BackupLock { path })
    }
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove backup lock file");
            }
        }
    }
}

/// Age of an existing lock file, `None` when no lock is present.
pub fn lock_age(backup_path: &Path) -> Option<Duration> {
    let modified = fs::metadata(lock_path(backup_path))
        .and_then(|meta| meta.modified())
        .ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Remove a lock older than `max_age`; such locks belong to crashed jobs.
/// Returns true when a stale lock was cleared.
pub fn remove_stale_lock(backup_path: &Path, max_age: Duration) -> bool {
    match lock_age(backup_path) {
        Some(age) if age > max_age => {
            let path = lock_path(backup_path);
            warn!(
                path = %path.display(),
                age_secs = age.as_secs(),
                "removing stale backup lock"
            );
            fs::remove_file(&path).is_ok()
        }
        _ => false,
    }
}

/// Write the completion marker: timestamp, replica size, free-form stats.
/// Marker trouble is logged, never fatal — the replica itself is fine.
pub fn mark_completed(backup_path: &Path, stats: serde_json::Value) {
    let file_size = fs::metadata(backup_path).map(|m| m.len()).unwrap_or(0);
    let marker = json!({
        "completed_at": Utc::now().to_rfc3339(),
        "backup_file": backup_path.to_string_lossy(),
        "file_size": file_size,
        "stats": stats,
    });
    let path = completion_path(backup_path);
    match serde_json::to_string_pretty(&marker) {
        Ok(body) => {
            if let Err(err) = fs::write(&path, body) {
                warn!(path = %path.display(), error = %err, "could not write completion marker");
            }
        }
        Err(err) => {
            warn!(error = %err, "could not serialise completion marker");
        }
    }
}

/// True when a completion marker exists and is younger than `max_age`.
pub fn is_recent(backup_path: &Path, max_age: Duration) -> bool {
    let path = completion_path(backup_path);
    let modified = match fs::metadata(&path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age < max_age,
        // Clock skew put the marker in the future; treat it as fresh.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn test_lock_created_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");
        let lock_file = lock_path(&backup);

        {
            let _lock = BackupLock::acquire(&backup).expect("lock acquired");
            assert!(lock_file.exists());
        }
        assert!(!lock_file.exists(), "lock removed on drop");
    }

    #[test]
    fn test_lock_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("subdir").join("nested").join("test.db");

        let _lock = BackupLock::acquire(&backup).expect("lock acquired");
        assert!(lock_path(&backup).exists());
    }

    #[test]
    fn test_lock_contains_process_info() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");

        let _lock = BackupLock::acquire(&backup).unwrap();
        let contents = fs::read_to_string(lock_path(&backup)).unwrap();
        assert!(contents.contains("PID: "));
        assert!(contents.contains(&std::process::id().to_string()));
        assert!(contents.contains("Timestamp: "));
    }

    #[test]
    fn test_lock_contention() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");

        let _held = BackupLock::acquire(&backup).unwrap();
        match BackupLock::acquire(&backup) {
            Err(LockError::Held(path)) => assert_eq!(path, lock_path(&backup)),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn test_lock_released_on_error_path() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");
        let lock_file = lock_path(&backup);

        let result = (|| -> Result<(), String> {
            let _lock = BackupLock::acquire(&backup).map_err(|e| e.to_string())?;
            assert!(lock_file.exists());
            Err("simulated table copy failure".to_string())
        })();

        assert!(result.is_err());
        assert!(!lock_file.exists(), "lock released despite the failure");
    }

    #[test]
    fn test_stale_lock_removal() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");
        let lock_file = lock_path(&backup);

        fs::write(&lock_file, "PID: 1\n").unwrap();
        let old = SystemTime::now() - Duration::from_secs(45 * 60);
        File::options()
            .write(true)
            .open(&lock_file)
            .unwrap()
            .set_modified(old)
            .unwrap();

        assert!(!remove_stale_lock(&backup, Duration::from_secs(60 * 60)));
        assert!(lock_file.exists(), "young-enough lock untouched");

        assert!(remove_stale_lock(&backup, Duration::from_secs(30 * 60)));
        assert!(!lock_file.exists());
    }

    #[test]
    fn test_completion_marker_contents() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");
        fs::write(&backup, "some backup data").unwrap();

        mark_completed(&backup, json!({"rows": 100, "tables": 5}));

        let body = fs::read_to_string(completion_path(&backup)).unwrap();
        let marker: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(marker["completed_at"].is_string());
        assert_eq!(marker["file_size"].as_u64().unwrap(), 16);
        assert_eq!(marker["stats"]["rows"], 100);
    }

    #[test]
    fn test_completion_marker_missing_backup_file() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("nonexistent.db");

        mark_completed(&backup, json!({}));

        let body = fs::read_to_string(completion_path(&backup)).unwrap();
        let marker: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(marker["file_size"], 0);
    }

    #[test]
    fn test_freshness_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");
        assert!(!is_recent(&backup, Duration::from_secs(3600)));
    }

    #[test]
    fn test_freshness_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("test.db");
        let marker = completion_path(&backup);
        fs::write(&marker, "{}").unwrap();

        let threshold = Duration::from_secs(3600);

        // One second younger than the threshold → still fresh, skip.
        let just_inside = SystemTime::now() - (threshold - Duration::from_secs(1));
        File::options()
            .write(true)
            .open(&marker)
            .unwrap()
            .set_modified(just_inside)
            .unwrap();
        assert!(is_recent(&backup, threshold));

        // One second older than the threshold → stale, proceed.
        let just_outside = SystemTime::now() - (threshold + Duration::from_secs(1));
        File::options()
            .write(true)
            .open(&marker)
            .unwrap()
            .set_modified(just_outside)
            .unwrap();
        assert!(!is_recent(&backup, threshold));
    }

    #[test]
    fn test_sibling_paths() {
        let backup = Path::new("/path/to/backup.db");
        assert_eq!(
            completion_path(backup),
            PathBuf::from("/path/to/backup.db.completed")
        );
        assert_eq!(lock_path(backup), PathBuf::from("/path/to/backup.db.lock"));
        assert_eq!(dam_path(backup), PathBuf::from("/path/to/backup.txt"));
    }
}
