use std::io;
use std::path::{Path, PathBuf};

/// Errors produced while acquiring or releasing a lock.
///
/// Platform backends never surface errors directly (see [`crate::backend`]); this
/// type is what [`crate::acquire::AcquireLoop`] maps their internal results onto.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The acquire budget elapsed, or a non-blocking attempt found the lock held.
    #[error("the file lock '{}' could not be acquired", .0.display())]
    Timeout(PathBuf),

    /// The current thread already holds this path through a different lock instance.
    #[error(
        "acquiring lock on '{}' would deadlock: this file is already locked by another \
         lock instance in the current thread. Use singleton mode to enable cross-instance \
         reentrant locking, or reuse the existing lock object",
        .0.display()
    )]
    Deadlock(PathBuf),

    /// A singleton lookup found an existing instance whose configuration disagreed.
    #[error(
        "a singleton lock for '{}' already exists with a different `{field}`",
        .path.display()
    )]
    ConfigurationMismatch {
        /// The canonical path the singleton registry is keyed on.
        path: PathBuf,
        /// Name of the configuration field that disagreed.
        field: &'static str,
    },

    /// A read/write lock instance was asked to switch modes (or to reenter under a
    /// different owning thread) while still held. Not part of the platform-backend
    /// taxonomy proper, but required to express the read/write state machine.
    #[error(
        "lock '{}' cannot change mode while held: release it first",
        .0.display()
    )]
    ModeConflict(PathBuf),

    /// The lock path (or its parent directory) could not be created, opened, or chmod'd.
    #[error("permission denied acquiring lock '{}'", .0.display())]
    Permission(PathBuf, #[source] io::Error),

    /// Any other unexpected OS failure.
    #[error("I/O error acquiring lock '{}'", .0.display())]
    Io(PathBuf, #[source] io::Error),
}

impl Error {
    /// The path the failing lock was operating on.
    pub fn path(&self) -> &Path {
        match self {
            Error::Timeout(p)
            | Error::Deadlock(p)
            | Error::ModeConflict(p)
            | Error::Permission(p, _)
            | Error::Io(p, _) => p,
            Error::ConfigurationMismatch { path, .. } => path,
        }
    }
}

impl From<simple_spawn_blocking::Cancelled> for Error {
    fn from(_: simple_spawn_blocking::Cancelled) -> Self {
        // A cancelled offloaded acquire never committed a handle to the context
        // (see crate::asyncio::exclusive), so there is no path-specific state to
        // report here beyond "it didn't happen".
        Error::Io(
            PathBuf::new(),
            io::Error::new(io::ErrorKind::Interrupted, "lock acquisition was cancelled"),
        )
    }
}
