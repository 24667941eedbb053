//! The shared acquire/release state machine used by both [`crate::ExclusiveLock`]
//! and the two internal locks behind [`crate::ReadWriteLock`].
//!
//! Grounded in `rattler_cache/src/package_cache/cache_lock.rs`'s combination of
//! a counter-guarded handle with a short internal mutex, generalized here to
//! also carry the lock mode and owning thread so the same routine serves
//! exclusive, reentrant-exclusive, and shared callers.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::backend::{AcquireOutcome, BackendKind, FatalKind, LockMode};
use crate::context::{ContextStorage, LockContext};
use crate::error::Error;
use crate::registry::DeadlockRegistry;

/// An [`BackendKind`] that can swap from [`BackendKind::Native`] to
/// [`BackendKind::Soft`] exactly once, in place, behind an atomic so readers
/// never need to take a lock just to pick which backend to call (spec.md
/// §4.5c: the swap is sticky and irreversible for the life of the instance).
pub(crate) struct AtomicBackend(AtomicU8);

const NATIVE: u8 = 0;
const SOFT: u8 = 1;

impl AtomicBackend {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(NATIVE))
    }

    pub(crate) fn get(&self) -> BackendKind {
        match self.0.load(Ordering::Acquire) {
            SOFT => BackendKind::Soft,
            _ => BackendKind::Native,
        }
    }

    /// Returns `true` the first time this is called (the caller should log a
    /// warning then); later calls on an already-soft instance are no-ops.
    fn force_soft(&self) -> bool {
        self.0.swap(SOFT, Ordering::AcqRel) != SOFT
    }

    /// Test-only equivalent of a real `Fatal(Unsupported)` response, used by
    /// `ExclusiveLock::with_backend_for_test` (spec.md §8, S8).
    pub(crate) fn force_soft_for_test(&self) {
        let _ = self.force_soft();
    }
}

/// Parameters that stay fixed for the duration of one `acquire` call.
pub(crate) struct AcquireParams<'a> {
    pub(crate) path: &'a Path,
    pub(crate) file_mode: Option<u32>,
    pub(crate) lifetime: Option<Duration>,
    pub(crate) poll_interval: Duration,
}

/// Blocks (subject to `timeout`) until `path` is held by the current
/// instance/thread in `lock_mode`, or returns an error.
///
/// `this` and `deadlock` are only used to consult and publish the process-wide
/// self-deadlock registry; `T` is the instance's own inner type (an opaque key
/// for `Arc::ptr_eq`, never dereferenced here).
pub(crate) fn acquire<T: 'static>(
    ctx: &ContextStorage,
    deadlock: &DeadlockRegistry<T>,
    this: &Arc<T>,
    backend: &AtomicBackend,
    lock_mode: LockMode,
    params: &AcquireParams<'_>,
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let current_thread = thread::current().id();
    let deadline = timeout.map(|t| Instant::now() + t);
    let path_buf = params.path.to_path_buf();

    loop {
        match check_or_claim(ctx, deadlock, this, lock_mode, current_thread, &path_buf)? {
            Claim::AlreadyHeld => return Ok(()),
            Claim::Attempt => {}
        }

        match backend
            .get()
            .try_acquire(params.path, params.file_mode, params.lifetime, lock_mode)
        {
            AcquireOutcome::Acquired(file) => {
                commit(ctx, deadlock, this, lock_mode, current_thread, file, &path_buf);
                return Ok(());
            }
            AcquireOutcome::Contended => {
                if deadline_exceeded(deadline) {
                    return Err(Error::Timeout(path_buf));
                }
                thread::sleep(params.poll_interval);
            }
            AcquireOutcome::Fatal(FatalKind::Unsupported, _) => {
                if backend.force_soft() {
                    tracing::warn!(
                        path = %params.path.display(),
                        "native locking unsupported on this filesystem, falling back to soft locking"
                    );
                }
                // Retry immediately against the newly-selected soft backend.
            }
            AcquireOutcome::Fatal(FatalKind::Permission, e) => {
                return Err(Error::Permission(path_buf, e));
            }
            AcquireOutcome::Fatal(FatalKind::Os, e) => {
                return Err(Error::Io(path_buf, e));
            }
        }
    }
}

fn deadline_exceeded(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(d) if Instant::now() >= d)
}

enum Claim {
    /// Reentrant call: the counter was bumped, nothing further to do.
    AlreadyHeld,
    /// Not held locally; go attempt the backend.
    Attempt,
}

/// Checks the in-process context for reentrancy/mode-conflict before ever
/// touching the backend. Mirrors spec.md §4.7's state-machine transitions:
/// switching mode on a held lock is `ERROR`, and so is a different thread
/// reentering a thread-pinned exclusive hold on a shared (non-thread-local)
/// context (the `owner_thread` field exists for exactly this check).
fn check_or_claim<T: 'static>(
    ctx: &ContextStorage,
    deadlock: &DeadlockRegistry<T>,
    this: &Arc<T>,
    lock_mode: LockMode,
    current_thread: ThreadId,
    path: &PathBuf,
) -> Result<Claim, Error> {
    ctx.with(|c| {
        if c.is_locked() {
            if let Some(held_mode) = c.mode {
                if held_mode != lock_mode {
                    return Err(Error::ModeConflict(path.clone()));
                }
            }
            let reentrant = match lock_mode {
                LockMode::Exclusive => c.owner_thread == Some(current_thread),
                LockMode::Shared => true,
            };
            if reentrant {
                c.counter += 1;
                return Ok(Claim::AlreadyHeld);
            }
            return Err(Error::ModeConflict(path.clone()));
        }
        // Self-deadlock only applies to exclusive holders (spec.md §4.3): two
        // readers on the same path never wait on each other, so a second,
        // distinct shared-mode instance on the current thread must be free to
        // proceed rather than being mistaken for a nested exclusive self-hold.
        if lock_mode == LockMode::Exclusive && deadlock.conflicting_owner(path, this, current_thread) {
            return Err(Error::Deadlock(path.clone()));
        }
        Ok(Claim::Attempt)
    })
}

fn commit<T: 'static>(
    ctx: &ContextStorage,
    deadlock: &DeadlockRegistry<T>,
    this: &Arc<T>,
    lock_mode: LockMode,
    current_thread: ThreadId,
    file: std::fs::File,
    path: &PathBuf,
) {
    ctx.with(|c: &mut LockContext| {
        c.handle = Some(file);
        c.counter = 1;
        c.mode = Some(lock_mode);
        c.owner_thread = match lock_mode {
            LockMode::Exclusive => Some(current_thread),
            LockMode::Shared => None,
        };
    });
    // Only exclusive holders are published: the registry exists to catch a
    // thread nesting two distinct instances' exclusive holds on itself, and
    // readers never self-deadlock (see `check_or_claim`).
    if lock_mode == LockMode::Exclusive {
        deadlock.publish(path.clone(), this, current_thread);
    }
}

/// Decrements the recursion counter and, on the last release, hands the held
/// handle back to the backend and clears the deadlock registry entry.
///
/// Returns `true` if this call actually released the underlying OS lock.
pub(crate) fn release<T: 'static>(
    ctx: &ContextStorage,
    deadlock: &DeadlockRegistry<T>,
    backend: &AtomicBackend,
    path: &Path,
) -> bool {
    let file = ctx.with(|c| {
        if c.counter == 0 {
            return None;
        }
        c.counter -= 1;
        if c.counter == 0 {
            let mode = c.mode.take();
            c.owner_thread = None;
            c.handle.take().map(|handle| (handle, mode))
        } else {
            None
        }
    });
    match file {
        Some((file, mode)) => {
            backend.get().release(file, path);
            // Only exclusive holds were ever published (see `commit`).
            if mode == Some(LockMode::Exclusive) {
                deadlock.clear(&path.to_path_buf());
            }
            true
        }
        None => false,
    }
}

/// Unconditionally drops the held handle and zeroes the counter, regardless of
/// how many nested acquisitions are outstanding (spec.md §4.6, `force_release`).
pub(crate) fn force_release<T: 'static>(
    ctx: &ContextStorage,
    deadlock: &DeadlockRegistry<T>,
    backend: &AtomicBackend,
    path: &Path,
) -> bool {
    let file = ctx.with(|c| {
        c.counter = 0;
        c.owner_thread = None;
        let mode = c.mode.take();
        c.handle.take().map(|handle| (handle, mode))
    });
    match file {
        Some((file, mode)) => {
            backend.get().release(file, path);
            if mode == Some(LockMode::Exclusive) {
                deadlock.clear(&path.to_path_buf());
            }
            true
        }
        None => false,
    }
}
