//! The writer-preferring read/write lock (spec.md §4.7), built on a pair of
//! private [`ExclusiveLock`]s named `inner` (the mutual-exclusion primitive)
//! and `outer` (the writer-intent signal).

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use crate::backend::LockMode;
use crate::config::LockConfig;
use crate::error::Error;
use crate::exclusive::ExclusiveLock;
use crate::registry::{Kind as RegistryKind, SingletonRegistry, SINGLETON_CONSTRUCTION_LOCK};
use std::sync::Arc;

static SINGLETONS: SingletonRegistry<RwState> = SingletonRegistry::new();

/// Tracks which mode this instance currently holds, so a same-mode reentrant
/// call skips straight to the inner lock's own counter and a mode switch is
/// rejected before either sub-lock is touched (spec.md §4.7 state machine).
struct RwState {
    inner: ExclusiveLock,
    outer: ExclusiveLock,
    config: LockConfig,
    held_mode: Mutex<Option<LockMode>>,
}

/// A cross-process, writer-preferring read/write lock.
#[derive(Clone)]
pub struct ReadWriteLock(Arc<RwState>);

/// A scoped acquisition of a [`ReadWriteLock`] in a specific mode.
#[must_use = "the lock is released when this guard is dropped"]
pub struct RwGuard<'a> {
    lock: &'a ReadWriteLock,
    mode: LockMode,
}

impl Drop for RwGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_mode(self.mode);
    }
}

impl ReadWriteLock {
    /// Constructs a read/write lock whose `inner`/`outer` files are derived
    /// from `path` (`path.inner`, `path.outer`).
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, Error> {
        Self::with_config(LockConfig::new(path))
    }

    pub fn with_config(config: LockConfig) -> Result<Self, Error> {
        if !config.singleton() {
            return Ok(Self(Arc::new(Self::build_state(config)?)));
        }

        let canonical = crate::exclusive::canonical_lock_path(config.path())
            .map_err(|e| Error::Io(config.path().to_path_buf(), e))?;

        let _guard = SINGLETON_CONSTRUCTION_LOCK.lock();
        if let Some(existing) = SINGLETONS.lookup(RegistryKind::ReadWrite, &canonical) {
            if let Some(field) = existing.config.first_mismatch(&config) {
                return Err(Error::ConfigurationMismatch {
                    path: canonical,
                    field,
                });
            }
            return Ok(Self(existing));
        }

        let state = Arc::new(Self::build_state(config)?);
        SINGLETONS.publish(RegistryKind::ReadWrite, canonical, &state);
        Ok(Self(state))
    }

    fn build_state(config: LockConfig) -> Result<RwState, Error> {
        // The two sub-locks never go through the singleton registry
        // themselves: the ReadWriteLock instance *is* the singleton, if any.
        let sub_config = |suffix: &str| {
            LockConfig::new(with_extension_suffix(config.path(), suffix))
                .with_timeout(config.timeout())
                .with_blocking(config.blocking())
                .with_poll_interval(config.poll_interval())
                .with_thread_local(config.thread_local())
        };
        let inner = ExclusiveLock::build_unregistered(
            match config.mode() {
                Some(mode) => sub_config("inner").with_mode(mode),
                None => sub_config("inner"),
            },
        )?;
        let outer = ExclusiveLock::build_unregistered(
            match config.mode() {
                Some(mode) => sub_config("outer").with_mode(mode),
                None => sub_config("outer"),
            },
        )?;
        Ok(RwState {
            inner,
            outer,
            config,
            held_mode: Mutex::new(None),
        })
    }

    /// Acquires the lock for reading. Multiple readers may hold concurrently
    /// unless a writer is already waiting or holding.
    pub fn read(&self, timeout: Option<Option<Duration>>, blocking: Option<bool>) -> Result<RwGuard<'_>, Error> {
        self.acquire_mode(LockMode::Shared, timeout, blocking)
    }

    /// Acquires the lock for writing. Excludes every other reader and writer.
    pub fn write(&self, timeout: Option<Option<Duration>>, blocking: Option<bool>) -> Result<RwGuard<'_>, Error> {
        self.acquire_mode(LockMode::Exclusive, timeout, blocking)
    }

    /// Acquires the lock in `mode`. Exposed at `pub(crate)` visibility (in
    /// addition to the public [`Self::read`]/[`Self::write`]) so the async
    /// adapter can offload it by name instead of through a closure over
    /// `read`/`write`.
    pub(crate) fn acquire_mode(
        &self,
        mode: LockMode,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> Result<RwGuard<'_>, Error> {
        {
            let held = self.0.held_mode.lock();
            if let Some(held_mode) = *held {
                if held_mode != mode {
                    return Err(Error::ModeConflict(self.0.inner.lock_file().to_path_buf()));
                }
                // Reentrant in the same mode: the inner lock's own counter
                // tracks recursion depth, outer stays exactly as it is.
                drop(held);
                self.0
                    .inner
                    .acquire_in_mode(self.inner_mode(mode), timeout, blocking)?;
                return Ok(RwGuard { lock: self, mode });
            }
        }

        match mode {
            LockMode::Shared => {
                // Take outer, then inner (shared where the backend supports
                // it), then release outer immediately so concurrent readers
                // only ever serialize briefly on outer (spec.md §4.7 step 2).
                let outer_guard = self.0.outer.acquire(timeout, blocking)?;
                let result = self
                    .0
                    .inner
                    .acquire_in_mode(self.inner_mode(mode), timeout, blocking);
                drop(outer_guard);
                result?;
            }
            LockMode::Exclusive => {
                // Keep outer held for the whole write: any new reader blocks
                // on outer, which this writer already holds (step 3).
                std::mem::forget(self.0.outer.acquire(timeout, blocking)?);
                if let Err(e) = self
                    .0
                    .inner
                    .acquire_in_mode(self.inner_mode(mode), timeout, blocking)
                {
                    // Undo the forgotten outer acquisition on failure so the
                    // counter doesn't leak (spec.md §8 property 2).
                    self.0.outer.release(false);
                    return Err(e);
                }
            }
        }

        *self.0.held_mode.lock() = Some(mode);
        Ok(RwGuard { lock: self, mode })
    }

    /// Resolves the mode a reader should request on `inner`: true `Shared` on
    /// backends that support reader concurrency, or degraded to `Exclusive`
    /// (serialized readers) on `SoftExistence` and similar (spec.md §4.7,
    /// "otherwise the design degrades to a mutex"). Writers always request
    /// `Exclusive` regardless of backend.
    fn inner_mode(&self, requested: LockMode) -> LockMode {
        match requested {
            LockMode::Exclusive => LockMode::Exclusive,
            LockMode::Shared if self.0.inner.backend_supports_shared() => LockMode::Shared,
            LockMode::Shared => LockMode::Exclusive,
        }
    }

    pub(crate) fn release_mode(&self, mode: LockMode) {
        self.0.inner.release(false);
        let mut held = self.0.held_mode.lock();
        if self.0.inner.lock_counter() == 0 {
            *held = None;
            if mode == LockMode::Exclusive {
                self.0.outer.release(false);
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.0.inner.is_locked()
    }

    pub fn lock_counter(&self) -> u32 {
        self.0.inner.lock_counter()
    }

    pub fn lock_file(&self) -> &Path {
        self.0.config.path()
    }

    pub fn is_singleton(&self) -> bool {
        self.0.config.singleton()
    }

    pub fn is_thread_local(&self) -> bool {
        self.0.config.thread_local()
    }
}

fn with_extension_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_owned()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    match path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serial_test::serial;

    /// S6: write() nested three deep reaches counter 3, then unwinds to 0.
    #[test]
    fn write_recursion_balances() {
        let dir = tempfile::tempdir().unwrap();
        let rw = ReadWriteLock::new(dir.path().join("rw.lock")).unwrap();
        let g1 = rw.write(None, None).unwrap();
        let g2 = rw.write(None, None).unwrap();
        let g3 = rw.write(None, None).unwrap();
        assert_eq!(rw.lock_counter(), 3);
        drop(g3);
        drop(g2);
        assert!(rw.is_locked());
        drop(g1);
        assert!(!rw.is_locked());
    }

    /// Multiple readers may hold concurrently (distinct instances, same
    /// singleton path, or here simply recursive reads on one instance).
    #[test]
    fn read_recursion_balances() {
        let dir = tempfile::tempdir().unwrap();
        let rw = ReadWriteLock::new(dir.path().join("rw.lock")).unwrap();
        let g1 = rw.read(None, None).unwrap();
        let g2 = rw.read(None, None).unwrap();
        assert_eq!(rw.lock_counter(), 2);
        drop(g2);
        drop(g1);
        assert!(!rw.is_locked());
    }

    /// State machine: switching mode on a still-held lock is an error
    /// (spec.md §4.7: `HOLDING(R,n) --acquire(W)-> ERROR`).
    #[test]
    fn mode_switch_while_held_errors() {
        let dir = tempfile::tempdir().unwrap();
        let rw = ReadWriteLock::new(dir.path().join("rw.lock")).unwrap();
        let _read_guard = rw.read(None, None).unwrap();
        let result = rw.write(Some(Some(std::time::Duration::from_millis(10))), None);
        assert_matches!(result, Err(Error::ModeConflict(_)));
        // The failed switch attempt must not have touched the counter.
        assert_eq!(rw.lock_counter(), 1);
    }

    /// A writer excludes a concurrent reader on a distinct instance of the
    /// same path (real OS-level mutual exclusion, not just in-process state).
    #[test]
    fn writer_excludes_other_instance_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.lock");
        let writer_lock = ReadWriteLock::new(&path).unwrap();
        let _write_guard = writer_lock.write(None, None).unwrap();

        let reader_lock = ReadWriteLock::new(&path).unwrap();
        let result = std::thread::spawn(move || reader_lock.read(None, Some(false)))
            .join()
            .unwrap();
        assert_matches!(result, Err(Error::Timeout(_)));
    }

    /// Two distinct `ReadWriteLock` instances on the same path, both reading
    /// from the *same* thread, must not trip the self-deadlock check: readers
    /// never exclude other readers, so this is legal concurrency, not a
    /// thread nesting two exclusive holds on itself (spec.md §4.3).
    #[test]
    fn same_thread_distinct_instances_can_both_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.lock");
        let r1 = ReadWriteLock::new(&path).unwrap();
        let r2 = ReadWriteLock::new(&path).unwrap();

        let _g1 = r1.read(Some(Some(std::time::Duration::from_millis(100))), None)
            .unwrap();
        let _g2 = r2.read(Some(Some(std::time::Duration::from_millis(100))), None)
            .unwrap();
        assert!(r1.is_locked());
        assert!(r2.is_locked());
    }

    /// Singleton identity (property 5) holds for `ReadWriteLock` the same way
    /// it does for `ExclusiveLock`: matching config on the same path returns
    /// the same instance, and mismatched config is rejected.
    #[test]
    #[serial]
    fn singleton_same_config_returns_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.lock");
        let l1 = ReadWriteLock::with_config(LockConfig::new(&path).with_singleton(true)).unwrap();
        let l2 = ReadWriteLock::with_config(LockConfig::new(&path).with_singleton(true)).unwrap();
        let _g1 = l1.read(None, None).unwrap();
        let _g2 = l2.read(None, None).unwrap();
        assert_eq!(l1.lock_counter(), 2);
    }

    #[test]
    #[serial]
    fn singleton_mismatched_config_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.lock");
        let _l1 = ReadWriteLock::with_config(
            LockConfig::new(&path).with_singleton(true).with_blocking(true),
        )
        .unwrap();
        let result = ReadWriteLock::with_config(
            LockConfig::new(&path).with_singleton(true).with_blocking(false),
        );
        assert_matches!(result, Err(Error::ConfigurationMismatch { field: "blocking", .. }));
    }
}
