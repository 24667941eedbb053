//! The cooperative-task mirror of the sync API (spec.md §4.8), gated behind
//! the `tokio` feature.
//!
//! Both lock flavors here wrap their sync counterpart and offload the
//! blocking acquire call to a worker thread via
//! [`simple_spawn_blocking::tokio::run_blocking_task`], exactly the pattern
//! `rattler`'s `LockFile::new_async` and `rattler_cache`'s `CacheRwLock`
//! acquire methods use. Releasing a held guard is a fast, non-blocking OS
//! call (unlink/unlock/close), so it runs synchronously in `Drop` rather than
//! needing its own offload.
//!
//! Async instances default to `thread_local(false)`: a task can migrate
//! across the runtime's worker threads between polls, and a thread-local
//! context would silently stop seeing a hold it took on a different thread.

mod exclusive;
mod rw;

pub use exclusive::{AsyncExclusiveLock, AsyncLockGuard};
pub use rw::{AsyncReadWriteLock, AsyncRwGuard};
