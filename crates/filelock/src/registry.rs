//! Process-wide registries (spec.md §4.3 / §4.4): the deadlock map used to
//! convert same-thread self-nesting into an immediate error, and the opt-in
//! singleton map used to canonicalize constructions on the same path.
//!
//! Both are `DashMap`s behind a lazily-initialized `OnceLock`, the idiom used
//! elsewhere in this workspace for process-wide concurrent maps (e.g.
//! `rattler_repodata_gateway::gateway::GatewayInner::subdirs`,
//! `rattler_cache`'s various cache registries). Neither registry exposes a
//! teardown API (spec.md §9): entries are removed individually as instances
//! release or are dropped.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock, Weak};
use std::thread::ThreadId;

use dashmap::DashMap;

/// Distinguishes the [`crate::ExclusiveLock`] singleton namespace from the
/// [`crate::ReadWriteLock`] one so two different lock *kinds* constructed on
/// the same path never collide (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Kind {
    Exclusive,
    ReadWrite,
}

pub(crate) struct DeadlockEntry<T> {
    pub(crate) instance: Weak<T>,
    pub(crate) owner_thread: ThreadId,
}

/// A process-wide map from canonical path to the lock instance currently
/// holding it and the thread that acquired it. Consulted (read-only) before
/// every backend call so a thread that nests two distinct instances on the
/// same path fails fast instead of deadlocking on its own OS lock.
pub(crate) struct DeadlockRegistry<T> {
    map: OnceLock<DashMap<PathBuf, DeadlockEntry<T>>>,
}

impl<T> DeadlockRegistry<T> {
    pub(crate) const fn new() -> Self {
        Self {
            map: OnceLock::new(),
        }
    }

    fn map(&self) -> &DashMap<PathBuf, DeadlockEntry<T>> {
        self.map.get_or_init(DashMap::new)
    }

    /// Returns `Some(other_instance)` if `path` is currently owned by a
    /// *different* instance on the current thread (spec.md §4.3's deadlock
    /// condition), `None` otherwise (including when the owner is `self` or a
    /// different thread entirely, both of which proceed normally).
    pub(crate) fn conflicting_owner(
        &self,
        path: &PathBuf,
        this: &Arc<T>,
        current_thread: ThreadId,
    ) -> bool
    where
        T: 'static,
    {
        let Some(entry) = self.map().get(path) else {
            return false;
        };
        if entry.owner_thread != current_thread {
            return false;
        }
        match entry.instance.upgrade() {
            Some(owner) => !Arc::ptr_eq(&owner, this),
            None => false,
        }
    }

    /// Publishes `this` as the current holder of `path` on `owner_thread`.
    /// Called on the zero→one counter transition.
    pub(crate) fn publish(&self, path: PathBuf, this: &Arc<T>, owner_thread: ThreadId) {
        self.map().insert(
            path,
            DeadlockEntry {
                instance: Arc::downgrade(this),
                owner_thread,
            },
        );
    }

    /// Removes the entry for `path`. Called on the one→zero counter
    /// transition or a forced release.
    pub(crate) fn clear(&self, path: &PathBuf) {
        self.map().remove(path);
    }
}

/// A process-wide weak map from `(kind, canonical path)` to a lock instance,
/// consulted at construction time when `singleton = true`.
pub(crate) struct SingletonRegistry<T> {
    map: OnceLock<DashMap<(Kind, PathBuf), Weak<T>>>,
}

impl<T> SingletonRegistry<T> {
    pub(crate) const fn new() -> Self {
        Self {
            map: OnceLock::new(),
        }
    }

    fn map(&self) -> &DashMap<(Kind, PathBuf), Weak<T>> {
        self.map.get_or_init(DashMap::new)
    }

    /// Looks up a live instance for `(kind, path)`, pruning the entry first if
    /// its weak reference has already expired.
    pub(crate) fn lookup(&self, kind: Kind, path: &PathBuf) -> Option<Arc<T>> {
        let key = (kind, path.clone());
        let upgraded = self.map().get(&key).and_then(|e| e.upgrade());
        if upgraded.is_none() {
            self.map().remove(&key);
        }
        upgraded
    }

    /// Publishes a newly constructed instance as the singleton for `(kind,
    /// path)`. Callers must have just failed `lookup` for the same key under
    /// a serializing lock (see `ExclusiveLock::new`) to avoid racing another
    /// thread's construction.
    pub(crate) fn publish(&self, kind: Kind, path: PathBuf, instance: &Arc<T>) {
        self.map().insert((kind, path), Arc::downgrade(instance));
    }
}

/// A small process-wide mutex serializing singleton construction so two
/// threads calling `ExclusiveLock::new` for the same path at the same instant
/// can't both observe a cache miss and each publish their own instance.
pub(crate) static SINGLETON_CONSTRUCTION_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
