//! Per-lock mutable state: the held native handle, the recursion counter, and
//! (for shared contexts) the owning thread. Lives either thread-locally or
//! behind a short process-internal mutex, mirroring the `Arc<Mutex<File>>` /
//! `Arc<RwLock<_>>` pattern `rattler_cache::package_cache::cache_lock::CacheRwLock`
//! uses for its own lock state.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::backend::LockMode;

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(0);

/// Allocates a process-unique id to key a lock instance's slot in thread-local
/// storage. Using a counter rather than the instance's own address means the
/// key is stable before the instance is fully constructed and never collides
/// across instance generations.
pub(crate) fn next_context_id() -> usize {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
pub(crate) struct LockContext {
    pub(crate) handle: Option<File>,
    pub(crate) counter: u32,
    pub(crate) mode: Option<LockMode>,
    pub(crate) owner_thread: Option<ThreadId>,
}

impl LockContext {
    pub(crate) fn is_locked(&self) -> bool {
        self.handle.is_some()
    }

    pub(crate) fn reset(&mut self) {
        self.handle = None;
        self.counter = 0;
        self.mode = None;
        self.owner_thread = None;
    }
}

thread_local! {
    static PER_THREAD: RefCell<HashMap<usize, LockContext>> = RefCell::new(HashMap::new());
}

/// Either a `thread_local!`-backed slot (independent counters per thread) or a
/// single context shared by every thread of the process, selected once at
/// construction by `LockConfig::thread_local`.
pub(crate) enum ContextStorage {
    ThreadLocal(usize),
    Shared(Mutex<LockContext>),
}

impl ContextStorage {
    pub(crate) fn new(thread_local: bool, id: usize) -> Self {
        if thread_local {
            ContextStorage::ThreadLocal(id)
        } else {
            ContextStorage::Shared(Mutex::new(LockContext::default()))
        }
    }

    /// Runs `f` with exclusive access to the context, whichever storage kind
    /// backs this instance.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut LockContext) -> R) -> R {
        match self {
            ContextStorage::ThreadLocal(id) => PER_THREAD.with(|cell| {
                let mut map = cell.borrow_mut();
                f(map.entry(*id).or_default())
            }),
            ContextStorage::Shared(mutex) => f(&mut mutex.lock()),
        }
    }

    pub(crate) fn is_thread_local(&self) -> bool {
        matches!(self, ContextStorage::ThreadLocal(_))
    }
}
