//! C3 — Per-file task lock.
//!
//! Two layers, both keyed by `(absolute video path, normalized task kind)`:
//!
//! - an in-process keyed mutex, so two jobs for the same file and task inside
//!   this process serialize instead of racing on the same output files;
//! - a best-effort cross-process advisory lock file under
//!   `<artifact_dir>/.locks/<task>.lock`, so a second `scenevaultd` instance
//!   pointed at the same library doesn't stomp on the first one's output.
//!
//! Entries in the in-process table are never evicted; the key space is
//! bounded by the number of distinct (file, task) pairs ever touched, which
//! for a media library is small relative to run time.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use fs2::FileExt;

use crate::sync_ext::{CondvarExt, MutexExt};

fn normalize_task(task: &str) -> String {
    task.trim().to_ascii_lowercase()
}

fn lock_key(video_path: &Path, task: &str) -> String {
    format!("{}::{}", video_path.display(), normalize_task(task))
}

/// A binary exclusive lock built the same way as `DynamicSemaphore`
/// (Mutex + Condvar) rather than `std::sync::Mutex`, so the owning guard
/// can be returned by value without borrowing from the registry.
struct ExclusiveLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl ExclusiveLock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn lock(self: Arc<Self>) -> InProcessGuard {
        let mut locked = self.locked.lock_unpoisoned();
        while *locked {
            locked = self.cv.wait_unpoisoned(locked);
        }
        *locked = true;
        drop(locked);
        InProcessGuard { inner: self }
    }
}

/// Registry of in-process keyed mutexes, one per `(video path, task)` pair.
#[derive(Clone, Default)]
pub struct TaskLockRegistry {
    locks: Arc<Mutex<HashMap<String, Arc<ExclusiveLock>>>>,
}

impl TaskLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<ExclusiveLock> {
        self.locks
            .lock_unpoisoned()
            .entry(key.to_string())
            .or_insert_with(ExclusiveLock::new)
            .clone()
    }

    /// Acquire the in-process lock for `(video_path, task)`, blocking until
    /// it is free. The returned guard also attempts to acquire the
    /// cross-process advisory lock in `artifact_dir`; if that fails (lock
    /// held by another process, or the filesystem doesn't support
    /// advisory locks) the in-process lock is still held and the caller
    /// proceeds best-effort, matching the "advisory, not authoritative"
    /// framing of the cross-process layer.
    pub fn acquire(&self, video_path: &Path, task: &str, artifact_dir: &Path) -> TaskLockGuard {
        let key = lock_key(video_path, task);
        let lock = self.entry(&key);
        let cross_process = acquire_cross_process_lock(artifact_dir, &normalize_task(task));
        TaskLockGuard {
            _in_process: lock.lock(),
            _cross_process: cross_process,
        }
    }
}

struct InProcessGuard {
    inner: Arc<ExclusiveLock>,
}

impl Drop for InProcessGuard {
    fn drop(&mut self) {
        *self.inner.locked.lock_unpoisoned() = false;
        self.inner.cv.notify_one();
    }
}

/// Best-effort exclusive lock on `<artifact_dir>/.locks/<task>.lock`.
/// `None` means either the lock was contended by another process or the
/// lock file could not be created; callers proceed without cross-process
/// protection in that case (spec §5: advisory, not authoritative).
struct CrossProcessGuard {
    _file: File,
}

fn acquire_cross_process_lock(artifact_dir: &Path, normalized_task: &str) -> Option<CrossProcessGuard> {
    let lock_dir = artifact_dir.join(".locks");
    if fs::create_dir_all(&lock_dir).is_err() {
        return None;
    }
    let lock_path: PathBuf = lock_dir.join(format!("{normalized_task}.lock"));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .ok()?;
    file.try_lock_exclusive().ok()?;
    Some(CrossProcessGuard { _file: file })
}

impl Drop for CrossProcessGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._file);
    }
}

/// Holds both lock layers for the lifetime of a single generator
/// invocation. Dropping it releases the in-process mutex and, if held,
/// the cross-process advisory lock.
pub struct TaskLockGuard {
    _in_process: InProcessGuard,
    _cross_process: Option<CrossProcessGuard>,
}

impl TaskLockGuard {
    pub fn has_cross_process_lock(&self) -> bool {
        self._cross_process.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn same_key_serializes_across_threads() {
        let registry = TaskLockRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let video = PathBuf::from("/library/clip.mp4");
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = registry.clone();
            let dir_path = dir.path().to_path_buf();
            let video = video.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(std::thread::spawn(move || {
                let _guard = registry.acquire(&video, "thumbnail", &dir_path);
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_tasks_do_not_block_each_other() {
        let registry = TaskLockRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let video = PathBuf::from("/library/clip.mp4");
        let g1 = registry.acquire(&video, "thumbnail", dir.path());
        let g2 = registry.acquire(&video, "preview", dir.path());
        drop(g1);
        drop(g2);
    }

    #[test]
    fn task_normalization_shares_a_key() {
        let registry = TaskLockRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let video = PathBuf::from("/library/clip.mp4");
        assert_eq!(lock_key(&video, "Thumbnail"), lock_key(&video, "thumbnail "));
    }

    #[test]
    fn cross_process_lock_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let first = acquire_cross_process_lock(dir.path(), "thumbnail");
        assert!(first.is_some());
        let second = acquire_cross_process_lock(dir.path(), "thumbnail");
        assert!(second.is_none());
        drop(first);
        let third = acquire_cross_process_lock(dir.path(), "thumbnail");
        assert!(third.is_some());
    }
}
