//! The public exclusive-lock façade (spec.md §4.6).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::acquire::{self, AcquireParams, AtomicBackend};
use crate::config::LockConfig;
use crate::context::{next_context_id, ContextStorage};
use crate::error::Error;
use crate::registry::{DeadlockRegistry, Kind, SingletonRegistry, SINGLETON_CONSTRUCTION_LOCK};

static DEADLOCK: DeadlockRegistry<Inner> = DeadlockRegistry::new();
static SINGLETONS: SingletonRegistry<Inner> = SingletonRegistry::new();

pub(crate) struct Inner {
    config: LockConfig,
    /// Canonical (symlink-resolved, absolute) form of `config.path`, computed
    /// once at construction. This is what's actually opened/locked and what
    /// keys the deadlock/singleton registries (spec.md §4.3/§4.4).
    canonical_path: PathBuf,
    ctx: ContextStorage,
    backend: AtomicBackend,
}

impl Inner {
    fn acquire_mode(
        self: &Arc<Self>,
        lock_mode: crate::backend::LockMode,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<(), Error> {
        let (timeout, _) = self.config.resolve(timeout, blocking);
        let params = AcquireParams {
            path: &self.canonical_path,
            file_mode: self.config.mode,
            lifetime: self.config.lifetime,
            poll_interval: self.config.poll_interval,
        };
        tracing::debug!(path = %self.canonical_path.display(), ?lock_mode, "acquiring lock");
        let result = acquire::acquire(&self.ctx, &DEADLOCK, self, &self.backend, lock_mode, &params, timeout);
        match &result {
            Ok(()) => tracing::debug!(path = %self.canonical_path.display(), "lock acquired"),
            Err(e) => tracing::debug!(path = %self.canonical_path.display(), error = %e, "acquire failed"),
        }
        result
    }

    fn release_mode(self: &Arc<Self>, force: bool) -> bool {
        if force {
            acquire::force_release(&self.ctx, &DEADLOCK, &self.backend, &self.canonical_path)
        } else {
            acquire::release(&self.ctx, &DEADLOCK, &self.backend, &self.canonical_path)
        }
    }

    fn is_locked(&self) -> bool {
        self.ctx.with(|c| c.is_locked())
    }

    fn lock_counter(&self) -> u32 {
        self.ctx.with(|c| c.counter)
    }
}

/// A cross-process, reentrant exclusive lock over a filesystem path.
///
/// Cloning an `ExclusiveLock` is cheap (it's an `Arc` handle to the same
/// underlying instance); constructing a *new* `ExclusiveLock` on the same path
/// is a distinct instance unless `singleton(true)` was configured.
#[derive(Clone)]
pub struct ExclusiveLock(Arc<Inner>);

/// A scoped acquisition of an [`ExclusiveLock`]. Dropping the guard releases
/// one level of recursion; errors during the implicit release are suppressed
/// (spec.md §9, finalizer safety).
#[must_use = "the lock is released when this guard is dropped"]
pub struct LockGuard<'a> {
    lock: &'a ExclusiveLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.0.release_mode(false);
    }
}

impl ExclusiveLock {
    /// Constructs a new lock at `path` with library defaults. Equivalent to
    /// `ExclusiveLock::with_config(LockConfig::new(path))`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_config(LockConfig::new(path))
    }

    /// Constructs (or, for `singleton(true)`, looks up) a lock from an
    /// explicit [`LockConfig`].
    pub fn with_config(config: LockConfig) -> Result<Self, Error> {
        let canonical = canonical_lock_path(config.path())
            .map_err(|e| Error::Io(config.path().to_path_buf(), e))?;

        if !config.singleton() {
            return Ok(Self(Arc::new(Self::build_inner(config, canonical))));
        }

        let _guard = SINGLETON_CONSTRUCTION_LOCK.lock();
        if let Some(existing) = SINGLETONS.lookup(Kind::Exclusive, &canonical) {
            if let Some(field) = existing.config.first_mismatch(&config) {
                return Err(Error::ConfigurationMismatch {
                    path: canonical,
                    field,
                });
            }
            return Ok(Self(existing));
        }

        let inner = Arc::new(Self::build_inner(config, canonical.clone()));
        SINGLETONS.publish(Kind::Exclusive, canonical, &inner);
        Ok(Self(inner))
    }

    fn build_inner(config: LockConfig, canonical_path: PathBuf) -> Inner {
        let id = next_context_id();
        Inner {
            ctx: ContextStorage::new(config.thread_local(), id),
            backend: AtomicBackend::new(),
            canonical_path,
            config,
        }
    }

    /// Acquires the lock, blocking (subject to `timeout`/`blocking`) until it
    /// succeeds or the budget elapses. Returns a [`LockGuard`] that releases
    /// one recursion level on drop.
    ///
    /// `timeout`/`blocking` override the instance's configured defaults for
    /// this call only; `None` means "use the configured default".
    pub fn acquire(
        &self,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<LockGuard<'_>, Error> {
        self.0
            .acquire_mode(crate::backend::LockMode::Exclusive, timeout, blocking)?;
        Ok(LockGuard { lock: self })
    }

    /// Same as [`Self::acquire`], but lets a caller inside this crate request a
    /// shared (reader) hold instead of an exclusive one. Used exclusively by
    /// [`crate::rw::ReadWriteLock`] to acquire its `inner` sub-lock in shared
    /// mode on backends that support it (spec.md §4.7).
    pub(crate) fn acquire_in_mode(
        &self,
        mode: crate::backend::LockMode,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<LockGuard<'_>, Error> {
        self.0.acquire_mode(mode, timeout, blocking)?;
        Ok(LockGuard { lock: self })
    }

    /// Whether this instance's currently-selected backend can grant true
    /// concurrent access to [`crate::backend::LockMode::Shared`] holders
    /// (native `flock`/`LockFileEx`), as opposed to degrading shared requests
    /// to mutual exclusion (soft locks, and backends before their first
    /// acquire has picked a concrete kind).
    pub(crate) fn backend_supports_shared(&self) -> bool {
        self.0.backend.get().supports_shared()
    }

    /// Releases one recursion level. `force = true` drops the hold
    /// unconditionally, even if multiple levels were outstanding.
    ///
    /// Returns `true` if this call actually released the underlying OS lock
    /// (the last level, or a forced release of a held lock); `false` if the
    /// lock wasn't held at all.
    pub fn release(&self, force: bool) -> bool {
        self.0.release_mode(force)
    }

    /// Runs `f` with the lock held, releasing it when `f` returns. The
    /// decorator form from spec.md §4.6: a panic inside `f` still unwinds
    /// through the guard's `Drop`, so the lock is released either way.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> Result<R, Error> {
        let _guard = self.acquire(None, None)?;
        Ok(f())
    }

    pub fn is_locked(&self) -> bool {
        self.0.is_locked()
    }

    pub fn lock_counter(&self) -> u32 {
        self.0.lock_counter()
    }

    pub fn lock_file(&self) -> &Path {
        &self.0.canonical_path
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.0.config.timeout()
    }

    pub fn blocking(&self) -> bool {
        self.0.config.blocking()
    }

    pub fn mode(&self) -> Option<u32> {
        self.0.config.mode()
    }

    pub fn is_singleton(&self) -> bool {
        self.0.config.singleton()
    }

    pub fn is_thread_local(&self) -> bool {
        self.0.ctx.is_thread_local()
    }

    /// Builds a lock that bypasses the singleton registry entirely, used by
    /// `ReadWriteLock` for its private `inner`/`outer` components (which must
    /// never collide with, or be looked up by, user-facing singleton
    /// `ExclusiveLock` instances on related paths).
    pub(crate) fn build_unregistered(config: LockConfig) -> Result<Self, Error> {
        let canonical = canonical_lock_path(config.path())
            .map_err(|e| Error::Io(config.path().to_path_buf(), e))?;
        Ok(Self(Arc::new(Self::build_inner(config, canonical))))
    }

    /// Test-only hook (spec.md §8, S8): forces this instance onto the soft
    /// backend without going through a real `Fatal(Unsupported)` response, so
    /// the fallback's externally-observable behavior can be tested without
    /// monkey-patching the OS call.
    #[doc(hidden)]
    pub fn with_backend_for_test(self, force_soft: bool) -> Self {
        if force_soft {
            self.0.backend.force_soft_for_test();
        }
        self
    }
}

/// Resolves `path`'s parent directory to an absolute, symlink-free form and
/// rejoins the file name, without requiring the lock file itself to exist yet
/// (unlike canonicalizing the whole path, which requires every component to
/// exist).
pub(crate) fn canonical_lock_path(path: &Path) -> io::Result<PathBuf> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "lock path has no file name")
    })?;
    let parent = match parent {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            fs::canonicalize(parent)?
        }
        None => std::env::current_dir()?,
    };
    Ok(parent.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serial_test::serial;
    use std::time::Duration;

    /// S1: a scoped acquire reports locked while the guard is alive and
    /// unlocked once it's dropped, counter returning to zero either way.
    #[test]
    fn basic_scoped_acquire_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ExclusiveLock::new(dir.path().join("x.lock")).unwrap();
        assert!(!lock.is_locked());
        {
            let _guard = lock.acquire(None, None).unwrap();
            assert!(lock.is_locked());
            assert_eq!(lock.lock_counter(), 1);
        }
        assert!(!lock.is_locked());
        assert_eq!(lock.lock_counter(), 0);
        assert!(!dir.path().join("x.lock").exists());
    }

    /// Property 4: acquiring k times and releasing k times leaves the lock
    /// unheld; releasing once more is a no-op (Open Question 1).
    #[test]
    fn reentrant_same_instance_balances() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ExclusiveLock::new(dir.path().join("x.lock")).unwrap();
        let g1 = lock.acquire(None, None).unwrap();
        let g2 = lock.acquire(None, None).unwrap();
        let g3 = lock.acquire(None, None).unwrap();
        assert_eq!(lock.lock_counter(), 3);
        drop(g3);
        drop(g2);
        assert!(lock.is_locked());
        drop(g1);
        assert!(!lock.is_locked());
        // One release too many is a silent no-op, not an error.
        assert!(!lock.release(false));
    }

    /// S4: a second, distinct instance on the same path deadlocks against the
    /// first instance's hold in the same thread.
    #[test]
    #[serial]
    fn same_thread_distinct_instances_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z.lock");
        let l1 = ExclusiveLock::new(&path).unwrap();
        let _g1 = l1.acquire(None, None).unwrap();

        let l2 = ExclusiveLock::new(&path).unwrap();
        let result = l2.acquire(Some(Some(Duration::from_secs(1))), None);
        assert_matches!(result, Err(Error::Deadlock(_)));
    }

    /// Singleton identity (property 5): two singleton constructions with
    /// matching config on the same path return the same instance.
    #[test]
    #[serial]
    fn singleton_same_config_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.lock");
        let l1 = ExclusiveLock::with_config(LockConfig::new(&path).with_singleton(true)).unwrap();
        let l2 = ExclusiveLock::with_config(LockConfig::new(&path).with_singleton(true)).unwrap();
        let _g1 = l1.acquire(None, None).unwrap();
        // l2 is the same instance, so this is reentrant, not contended.
        let _g2 = l2.acquire(Some(Some(Duration::from_millis(10))), None).unwrap();
        assert_eq!(l1.lock_counter(), 2);
    }

    /// Singleton identity: mismatched config on the same path is rejected
    /// without mutating the registry (property 5).
    #[test]
    #[serial]
    fn singleton_mismatched_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.lock");
        let _l1 = ExclusiveLock::with_config(
            LockConfig::new(&path).with_singleton(true).with_blocking(true),
        )
        .unwrap();
        let result = ExclusiveLock::with_config(
            LockConfig::new(&path).with_singleton(true).with_blocking(false),
        );
        assert_matches!(result, Err(Error::ConfigurationMismatch { field: "blocking", .. }));
    }

    /// S3: a non-blocking acquire against an already-held lock fails fast.
    #[test]
    fn non_blocking_contended_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.lock");
        let holder = ExclusiveLock::new(&path).unwrap();
        let _g = holder.acquire(None, None).unwrap();

        let waiter = ExclusiveLock::new(&path).unwrap();
        let start = std::time::Instant::now();
        // A distinct instance on the same path from a *different* thread is
        // not a self-deadlock; it contends on the real OS lock.
        let result = std::thread::spawn(move || waiter.acquire(None, Some(false)))
            .join()
            .unwrap();
        assert_matches!(result, Err(Error::Timeout(_)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    /// S8: forcing the soft backend still yields a working, observable lock
    /// whose file matches the two-line `pid\nhostname\n` format.
    #[test]
    fn soft_fallback_is_transparent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soft.lock");
        let lock = ExclusiveLock::new(&path)
            .unwrap()
            .with_backend_for_test(true);
        let _guard = lock.acquire(None, None).unwrap();
        assert!(lock.is_locked());
        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        let pid: u32 = lines.next().unwrap().parse().unwrap();
        assert_eq!(pid, std::process::id());
        assert!(lines.next().is_some());
        assert!(lines.next().is_none());
    }
}
