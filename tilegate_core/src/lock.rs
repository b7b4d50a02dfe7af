//! Per-fingerprint mutual exclusion.
//!
//! Two scopes are combined: an in-process async mutex (one task per
//! fingerprint per worker) and an optional cross-process file lock under
//! `tile_lock_dir` (one worker per fingerprint per machine or shared
//! filesystem). Guards release on drop, so every exit path — including
//! errors — unlocks.

use crate::LockTimeout;
use dashmap::DashMap;
use log::{debug, warn};
use std::{
	fs,
	path::{Path, PathBuf},
	sync::Arc,
	time::{Duration, SystemTime},
};
use tokio::sync::{Mutex, OwnedMutexGuard};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Entries in the in-process map are purged opportunistically once the map
/// grows past this size.
const PURGE_THRESHOLD: usize = 512;

/// Hands out per-fingerprint locks.
#[derive(Debug)]
pub struct TileLocker {
	mutexes: DashMap<String, Arc<Mutex<()>>>,
	lock_dir: Option<PathBuf>,
	timeout: Duration,
}

impl TileLocker {
	/// In-process locking only.
	pub fn new(timeout: Duration) -> TileLocker {
		TileLocker {
			mutexes: DashMap::new(),
			lock_dir: None,
			timeout,
		}
	}

	/// In-process plus cross-process file locks under `lock_dir`.
	pub fn with_lock_dir(timeout: Duration, lock_dir: &Path) -> TileLocker {
		TileLocker {
			mutexes: DashMap::new(),
			lock_dir: Some(lock_dir.to_path_buf()),
			timeout,
		}
	}

	/// Acquires the lock for `fingerprint`, blocking up to the configured
	/// timeout.
	///
	/// # Errors
	/// `LockTimeout` when the lock is still held elsewhere when the
	/// timeout expires; the caller must abort instead of serving a
	/// half-computed tile.
	pub async fn lock(&self, fingerprint: &str) -> Result<TileLockGuard, LockTimeout> {
		self.purge_unused();

		let mutex = self
			.mutexes
			.entry(fingerprint.to_string())
			.or_insert_with(|| Arc::new(Mutex::new(())))
			.clone();

		let guard = tokio::time::timeout(self.timeout, mutex.lock_owned())
			.await
			.map_err(|_| LockTimeout {
				fingerprint: fingerprint.to_string(),
				timeout: self.timeout,
			})?;

		let file = match &self.lock_dir {
			Some(dir) => Some(FileLock::acquire(dir, fingerprint, self.timeout).await?),
			None => None,
		};

		debug!("locked {fingerprint}");
		Ok(TileLockGuard {
			_mutex_guard: guard,
			_file: file,
		})
	}

	fn purge_unused(&self) {
		if self.mutexes.len() < PURGE_THRESHOLD {
			return;
		}
		self.mutexes.retain(|_, mutex| Arc::strong_count(mutex) > 1);
	}
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct TileLockGuard {
	_mutex_guard: OwnedMutexGuard<()>,
	_file: Option<FileLock>,
}

/// An exclusively created lock file. Stale files (older than twice the
/// timeout, e.g. from a crashed worker) are broken.
#[derive(Debug)]
struct FileLock {
	path: PathBuf,
}

impl FileLock {
	async fn acquire(dir: &Path, fingerprint: &str, timeout: Duration) -> Result<FileLock, LockTimeout> {
		let path = dir.join(format!("{}.lck", sanitize(fingerprint)));
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			if let Err(err) = fs::create_dir_all(dir) {
				warn!("could not create lock dir {dir:?}: {err}");
			}
			match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
				Ok(_) => return Ok(FileLock { path }),
				Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
					Self::break_stale(&path, timeout);
				}
				Err(err) => {
					warn!("lock file {path:?}: {err}");
				}
			}
			if tokio::time::Instant::now() >= deadline {
				return Err(LockTimeout {
					fingerprint: fingerprint.to_string(),
					timeout,
				});
			}
			tokio::time::sleep(LOCK_POLL_INTERVAL).await;
		}
	}

	fn break_stale(path: &Path, timeout: Duration) {
		let stale_after = timeout * 2;
		let Ok(metadata) = fs::metadata(path) else {
			return;
		};
		let age = metadata
			.modified()
			.ok()
			.and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
		if let Some(age) = age {
			if age > stale_after {
				warn!("breaking stale lock {path:?} ({age:?} old)");
				let _ = fs::remove_file(path);
			}
		}
	}
}

impl Drop for FileLock {
	fn drop(&mut self) {
		if let Err(err) = fs::remove_file(&self.path) {
			warn!("could not remove lock file {:?}: {err}", self.path);
		}
	}
}

fn sanitize(fingerprint: &str) -> String {
	fingerprint
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicU32, Ordering};

	#[tokio::test]
	async fn lock_serializes_tasks() {
		let locker = Arc::new(TileLocker::new(Duration::from_secs(5)));
		let running = Arc::new(AtomicU32::new(0));
		let max_seen = Arc::new(AtomicU32::new(0));

		let mut handles = Vec::new();
		for _ in 0..8 {
			let locker = locker.clone();
			let running = running.clone();
			let max_seen = max_seen.clone();
			handles.push(tokio::spawn(async move {
				let _guard = locker.lock("cache/grid/3-1-2").await.unwrap();
				let now = running.fetch_add(1, Ordering::SeqCst) + 1;
				max_seen.fetch_max(now, Ordering::SeqCst);
				tokio::time::sleep(Duration::from_millis(5)).await;
				running.fetch_sub(1, Ordering::SeqCst);
			}));
		}
		for handle in handles {
			handle.await.unwrap();
		}
		assert_eq!(max_seen.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn different_fingerprints_do_not_block() {
		let locker = TileLocker::new(Duration::from_millis(200));
		let _a = locker.lock("a").await.unwrap();
		let _b = locker.lock("b").await.unwrap();
	}

	#[tokio::test]
	async fn timeout_raises_lock_timeout() {
		let locker = TileLocker::new(Duration::from_millis(50));
		let _held = locker.lock("contested").await.unwrap();
		let err = locker.lock("contested").await.unwrap_err();
		assert_eq!(err.fingerprint, "contested");
	}

	#[tokio::test]
	async fn guard_drop_releases() {
		let locker = TileLocker::new(Duration::from_millis(200));
		{
			let _guard = locker.lock("fp").await.unwrap();
		}
		let _again = locker.lock("fp").await.unwrap();
	}

	#[tokio::test]
	async fn file_lock_blocks_second_locker() {
		let dir = assert_fs::TempDir::new().unwrap();
		let first = TileLocker::with_lock_dir(Duration::from_millis(100), dir.path());
		let second = TileLocker::with_lock_dir(Duration::from_millis(100), dir.path());

		let guard = first.lock("tile").await.unwrap();
		let err = second.lock("tile").await.unwrap_err();
		assert_eq!(err.fingerprint, "tile");

		drop(guard);
		let _ok = second.lock("tile").await.unwrap();
	}

	#[tokio::test]
	async fn stale_file_lock_is_broken() {
		let dir = assert_fs::TempDir::new().unwrap();
		let lock_path = dir.path().join("orphan.lck");
		fs::write(&lock_path, b"").unwrap();
		// age the file well past 2x timeout
		let old = SystemTime::now() - Duration::from_secs(3600);
		let file = fs::File::options().write(true).open(&lock_path).unwrap();
		file.set_modified(old).unwrap();
		drop(file);

		let locker = TileLocker::with_lock_dir(Duration::from_millis(300), dir.path());
		let _guard = locker.lock("orphan").await.unwrap();
	}

	#[test]
	fn sanitize_keeps_paths_flat() {
		assert_eq!(sanitize("cache/grid/3-1-2"), "cache_grid_3-1-2");
	}
}
