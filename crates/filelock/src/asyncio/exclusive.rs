use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::LockConfig;
use crate::error::Error;
use crate::exclusive::ExclusiveLock;

/// Cooperative-task mirror of [`crate::ExclusiveLock`].
#[derive(Clone)]
pub struct AsyncExclusiveLock(ExclusiveLock);

/// A scoped async acquisition of an [`AsyncExclusiveLock`]. Dropping the
/// guard releases one level of recursion synchronously; errors during the
/// implicit release are suppressed, same as the sync [`crate::LockGuard`].
#[must_use = "the lock is released when this guard is dropped"]
pub struct AsyncLockGuard<'a> {
    lock: &'a AsyncExclusiveLock,
}

impl Drop for AsyncLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.release(false);
    }
}

impl AsyncExclusiveLock {
    /// Constructs a new async lock at `path` with library defaults, except
    /// `thread_local` defaults to `false` (spec.md §4.8).
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_config(LockConfig::new(path).with_thread_local(false))
    }

    /// Constructs (or, for `singleton(true)`, looks up) an async lock from an
    /// explicit [`LockConfig`]. Unlike [`Self::new`], an explicit config's
    /// `thread_local` value is honored as given rather than overridden.
    pub fn with_config(config: LockConfig) -> Result<Self, Error> {
        ExclusiveLock::with_config(config).map(Self)
    }

    /// Acquires the lock, suspending the calling task (not the runtime
    /// thread) until it succeeds or the budget elapses.
    ///
    /// The entire blocking retry loop — every poll sleep and every backend
    /// `try_acquire` call — runs on a worker thread; the task only suspends
    /// once, awaiting that thread's result. The context (counter/handle) is
    /// only committed once the worker reports success, so a cancelled await
    /// (the task is dropped before the worker finishes) can never leave the
    /// counter in a half-incremented state: either the worker hadn't
    /// succeeded yet (nothing to undo) or it had, in which case the commit
    /// already happened and the lock is simply held until an explicit
    /// release (or the instance's own drop) reclaims it.
    pub async fn acquire(
        &self,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<AsyncLockGuard<'_>, Error> {
        let lock = self.0.clone();
        simple_spawn_blocking::tokio::run_blocking_task(move || -> Result<(), Error> {
            let guard = lock.acquire(timeout, blocking)?;
            // The guard's only job is to call `release` on drop; we want the
            // hold to outlive this closure, so we forget it rather than let
            // it run. The counter/handle it guards lives on the shared
            // `Inner` reachable through `self.0`, not in the guard itself.
            std::mem::forget(guard);
            Ok(())
        })
        .await?;
        Ok(AsyncLockGuard { lock: self })
    }

    /// Releases one recursion level. See [`crate::ExclusiveLock::release`].
    pub fn release(&self, force: bool) -> bool {
        self.0.release(force)
    }

    /// Runs `f` with the lock held, releasing it when `f` returns.
    pub async fn with_lock<R>(&self, f: impl FnOnce() -> R) -> Result<R, Error> {
        let _guard = self.acquire(None, None).await?;
        Ok(f())
    }

    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    pub fn lock_counter(&self) -> u32 {
        self.0.lock_counter()
    }

    pub fn lock_file(&self) -> &Path {
        self.0.lock_file()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.0.timeout()
    }

    pub fn blocking(&self) -> bool {
        self.0.blocking()
    }

    pub fn mode(&self) -> Option<u32> {
        self.0.mode()
    }

    pub fn is_singleton(&self) -> bool {
        self.0.is_singleton()
    }

    pub fn is_thread_local(&self) -> bool {
        self.0.is_thread_local()
    }
}
