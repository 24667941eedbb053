//! Cross-process, cross-thread advisory file locking.
//!
//! This crate provides two lock flavors over a named filesystem path, each
//! available in a blocking-thread API and (behind the `tokio` feature) a
//! cooperative-task API:
//!
//! - [`ExclusiveLock`]: one holder at a time, reentrant for the same
//!   instance.
//! - [`ReadWriteLock`]: many readers *xor* one writer, writer-preferring,
//!   built on a pair of [`ExclusiveLock`]s.
//!
//! Three platform backends provide the actual inter-process exclusion: an
//! advisory byte-range lock on POSIX (`flock`/`fcntl` via [`fs4`]), a
//! mandatory byte-range lock on Windows (`LockFileEx`), and an
//! existence-based "soft" lock that works on filesystems lacking native
//! locking (network mounts, some container overlay filesystems). A lock
//! instance starts on the platform-native backend and falls back to the soft
//! backend automatically, once, the first time the kernel reports the native
//! primitive unsupported.
//!
//! No central coordinator is required: the filesystem itself is the
//! rendezvous. This makes the crate suitable for serializing access to a
//! shared resource (a cache directory, a downloaded archive, a config file)
//! among cooperating processes that have no other way to talk to each other.
//!
//! ```no_run
//! use filelock::ExclusiveLock;
//!
//! # fn main() -> Result<(), filelock::Error> {
//! let lock = ExclusiveLock::new("/tmp/my-resource.lock")?;
//! {
//!     let _guard = lock.acquire(None, None)?;
//!     // `_guard` is held here; dropping it releases the lock.
//! }
//! assert!(!lock.is_locked());
//! # Ok(())
//! # }
//! ```
//!
//! See [`prelude`] for the common imports, and the crate's `DESIGN.md` for
//! the platform/backend matrix and the resolutions of the spec's open
//! questions (timeout/blocking precedence, force-release-when-unheld,
//! soft-lock hostname policy).

mod acquire;
#[cfg(feature = "tokio")]
pub mod asyncio;
mod backend;
mod config;
mod context;
mod error;
mod exclusive;
mod registry;
mod rw;

pub use config::LockConfig;
pub use error::Error;
pub use exclusive::{ExclusiveLock, LockGuard};
pub use rw::{ReadWriteLock, RwGuard};

/// Re-exports of the types most callers need.
pub mod prelude {
    pub use crate::{Error, ExclusiveLock, LockConfig, LockGuard, ReadWriteLock, RwGuard};

    #[cfg(feature = "tokio")]
    pub use crate::asyncio::{AsyncExclusiveLock, AsyncReadWriteLock};
}
