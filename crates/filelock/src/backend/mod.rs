//! Single-instance lock primitives.
//!
//! Each backend exposes a `try_acquire`/`release` pair that never blocks for
//! longer than a single system call; [`crate::acquire::AcquireLoop`] is
//! responsible for polling. Grounded in
//! `rattler_repodata_gateway/src/utils/flock.rs` (itself vendored from
//! `cargo`'s `util/flock.rs`) for the POSIX/Windows split and error
//! classification, and in `rattler_cache/src/package_cache/cache_lock.rs` for
//! layering `fs4` over raw syscalls where possible.

#[cfg(unix)]
mod posix;
mod soft;
#[cfg(windows)]
mod windows;

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Whether a native lock request wants exclusive or shared access. Only the
/// native backend (POSIX `flock`/Windows `LockFileEx`) can actually grant
/// shared access; [`BackendKind::Soft`] always behaves exclusively regardless
/// of the requested mode, since existence has no shared variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// Result of a single, non-blocking attempt to acquire a backend lock.
pub(crate) enum AcquireOutcome {
    Acquired(File),
    Contended,
    Fatal(FatalKind, io::Error),
}

/// Why a backend attempt can never succeed under current conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FatalKind {
    /// The kernel/filesystem doesn't implement the primitive at all.
    Unsupported,
    Permission,
    Os,
}

/// Which family of OS primitive a lock instance is currently using. Starts at
/// [`BackendKind::Native`] and may irreversibly swap to [`BackendKind::Soft`]
/// if the native backend reports [`FatalKind::Unsupported`] (spec.md §4.5c).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackendKind {
    Native,
    Soft,
}

impl BackendKind {
    pub(crate) fn try_acquire(
        self,
        path: &Path,
        mode: Option<u32>,
        lifetime: Option<Duration>,
        lock_mode: LockMode,
    ) -> AcquireOutcome {
        match self {
            #[cfg(unix)]
            BackendKind::Native => posix::try_acquire(path, mode, lock_mode),
            #[cfg(windows)]
            BackendKind::Native => windows::try_acquire(path, mode, lock_mode),
            BackendKind::Soft => soft::try_acquire(path, mode, lifetime),
        }
    }

    pub(crate) fn release(self, file: File, path: &Path) {
        match self {
            #[cfg(unix)]
            BackendKind::Native => posix::release(file, path),
            #[cfg(windows)]
            BackendKind::Native => windows::release(file, path),
            BackendKind::Soft => soft::release(file, path),
        }
    }

    /// Whether this backend can grant true reader concurrency for
    /// [`LockMode::Shared`] requests. Soft locks cannot: a second "shared"
    /// acquire would just collide on `O_EXCL`.
    pub(crate) fn supports_shared(self) -> bool {
        matches!(self, BackendKind::Native)
    }
}

#[cfg(unix)]
mod sys {
    use std::io::Error;

    // `fs4::fs_std::FileExt::try_lock_{exclusive,shared}` reports contention
    // as `Ok(false)`, never as a `WouldBlock` error (it mirrors
    // `std::fs::File::try_lock`), so `posix.rs` checks that return value
    // directly instead of going through this classifier.

    pub(super) fn error_unsupported(err: &Error) -> bool {
        match err.raw_os_error() {
            #[allow(unreachable_patterns)]
            Some(libc::ENOTSUP | libc::EOPNOTSUPP | libc::ENOSYS) => true,
            _ => false,
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::io::Error;
    use windows_sys::Win32::Foundation::{ERROR_INVALID_FUNCTION, ERROR_LOCK_VIOLATION};

    pub(super) fn error_contended(err: &Error) -> bool {
        err.kind() == std::io::ErrorKind::WouldBlock
            || err
                .raw_os_error()
                .is_some_and(|x| x as u32 == ERROR_LOCK_VIOLATION)
    }

    pub(super) fn error_unsupported(err: &Error) -> bool {
        err.raw_os_error()
            .is_some_and(|x| x as u32 == ERROR_INVALID_FUNCTION)
    }
}
