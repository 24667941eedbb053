use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::LockMode;
use crate::config::LockConfig;
use crate::error::Error;
use crate::rw::ReadWriteLock;

/// Cooperative-task mirror of [`crate::ReadWriteLock`].
#[derive(Clone)]
pub struct AsyncReadWriteLock(ReadWriteLock);

/// A scoped async acquisition of an [`AsyncReadWriteLock`] in a specific mode.
#[must_use = "the lock is released when this guard is dropped"]
pub struct AsyncRwGuard<'a> {
    lock: &'a AsyncReadWriteLock,
    mode: LockMode,
}

impl Drop for AsyncRwGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.release_mode(self.mode);
    }
}

impl AsyncReadWriteLock {
    /// Constructs a new async read/write lock at `path`, with `thread_local`
    /// defaulting to `false` (spec.md §4.8).
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_config(LockConfig::new(path).with_thread_local(false))
    }

    pub fn with_config(config: LockConfig) -> Result<Self, Error> {
        ReadWriteLock::with_config(config).map(Self)
    }

    /// Acquires the lock for reading; see [`AsyncExclusiveLock::acquire`] for
    /// the offload/cancellation contract.
    ///
    /// [`AsyncExclusiveLock::acquire`]: crate::asyncio::AsyncExclusiveLock::acquire
    pub async fn read(
        &self,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<AsyncRwGuard<'_>, Error> {
        self.acquire_mode(LockMode::Shared, timeout, blocking).await
    }

    /// Acquires the lock for writing.
    pub async fn write(
        &self,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<AsyncRwGuard<'_>, Error> {
        self.acquire_mode(LockMode::Exclusive, timeout, blocking).await
    }

    async fn acquire_mode(
        &self,
        mode: LockMode,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<AsyncRwGuard<'_>, Error> {
        let lock = self.0.clone();
        simple_spawn_blocking::tokio::run_blocking_task(move || -> Result<(), Error> {
            let guard = lock.acquire_mode(mode, timeout, blocking)?;
            std::mem::forget(guard);
            Ok(())
        })
        .await?;
        Ok(AsyncRwGuard { lock: self, mode })
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

    pub fn is_singleton(&self) -> bool {
        self.0.is_singleton()
    }

    pub fn is_thread_local(&self) -> bool {
        self.0.is_thread_local()
    }
}
