use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between polls while waiting for a contended lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Immutable-after-construction settings for an [`crate::ExclusiveLock`] or
/// [`crate::ReadWriteLock`].
///
/// `timeout: None` means "wait indefinitely" (spec's `-1`); `Some(Duration::ZERO)`
/// means "exactly one attempt" (spec's `0`).
#[derive(Debug, Clone, PartialEq)]
pub struct LockConfig {
    pub(crate) path: PathBuf,
    pub(crate) timeout: Option<Duration>,
    pub(crate) blocking: bool,
    pub(crate) mode: Option<u32>,
    pub(crate) poll_interval: Duration,
    pub(crate) thread_local: bool,
    pub(crate) singleton: bool,
    pub(crate) lifetime: Option<Duration>,
}

impl LockConfig {
    /// Start a new configuration for a lock at `path` with the library defaults:
    /// wait indefinitely, blocking, respect umask, poll every 50ms, thread-local
    /// context, no singleton, no soft-lock staleness expiry.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: None,
            blocking: true,
            mode: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            thread_local: true,
            singleton: false,
            lifetime: None,
        }
    }

    /// Default acquire budget. `None` waits indefinitely.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Default blocking flag; `false` short-circuits waiting.
    #[must_use]
    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    /// Unix permission bits applied to the lock file on creation. Unset respects
    /// the process umask and never calls `fchmod`.
    #[must_use]
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Minimum delay between retries in the poll loop.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// If `true` (the default), each thread sees an independent lock context and
    /// reentrancy is per-thread. If `false`, state is shared across all threads of
    /// the process.
    #[must_use]
    pub fn with_thread_local(mut self, thread_local: bool) -> Self {
        self.thread_local = thread_local;
        self
    }

    /// If `true`, construction for the same canonical path returns the existing
    /// instance rather than a new one.
    #[must_use]
    pub fn with_singleton(mut self, singleton: bool) -> Self {
        self.singleton = singleton;
        self
    }

    /// Staleness TTL for soft locks, in seconds since the lock file's mtime.
    /// `None` disables expiry.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// The filesystem path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The configured default timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The configured default blocking flag.
    pub fn blocking(&self) -> bool {
        self.blocking
    }

    /// The configured permission mode, if explicit.
    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    /// The configured poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether this configuration uses a thread-local context.
    pub fn thread_local(&self) -> bool {
        self.thread_local
    }

    /// Whether this configuration opts into the singleton registry.
    pub fn singleton(&self) -> bool {
        self.singleton
    }

    /// The configured soft-lock staleness TTL.
    pub fn lifetime(&self) -> Option<Duration> {
        self.lifetime
    }

    /// Resolve the effective timeout/blocking pair for a single `acquire` call,
    /// given optional per-call overrides.
    ///
    /// Per-call values override the instance default; an explicit `blocking =
    /// false` overrides any positive timeout (see DESIGN.md, "timeout vs blocking
    /// precedence").
    pub(crate) fn resolve(
        &self,
        timeout: Option<Option<Duration>>,
        blocking: Option<bool>,
    ) -> (Option<Duration>, bool) {
        let blocking = blocking.unwrap_or(self.blocking);
        let timeout = timeout.unwrap_or(self.timeout);
        if !blocking {
            (Some(Duration::ZERO), false)
        } else {
            (timeout, true)
        }
    }

    /// Compares every field that participates in singleton-registry compatibility
    /// checks, returning the name of the first field that disagrees.
    pub(crate) fn first_mismatch(&self, other: &LockConfig) -> Option<&'static str> {
        if self.timeout != other.timeout {
            return Some("timeout");
        }
        if self.blocking != other.blocking {
            return Some("blocking");
        }
        if self.mode != other.mode {
            return Some("mode");
        }
        if self.poll_interval != other.poll_interval {
            return Some("poll_interval");
        }
        if self.thread_local != other.thread_local {
            return Some("thread_local");
        }
        if self.lifetime != other.lifetime {
            return Some("lifetime");
        }
        None
    }
}
