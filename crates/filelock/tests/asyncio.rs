#![cfg(feature = "tokio")]
//! Cooperative-task mirror of the sync scenarios in spec.md §8, run under a
//! multi-threaded runtime so a task genuinely can (and, for `thread_local`
//! defaulting to `false`, is expected to) migrate across worker threads
//! between polls.

use filelock::asyncio::{AsyncExclusiveLock, AsyncReadWriteLock};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn basic_async_acquire_release() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AsyncExclusiveLock::new(dir.path().join("a.lock")).unwrap();
    assert!(!lock.is_locked());
    {
        let _guard = lock.acquire(None, None).await.unwrap();
        assert!(lock.is_locked());
    }
    assert!(!lock.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_non_blocking_contended_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.lock");
    let holder = AsyncExclusiveLock::new(&path).unwrap();
    let _guard = holder.acquire(None, None).await.unwrap();

    let waiter = AsyncExclusiveLock::new(&path).unwrap();
    let result = waiter.acquire(None, Some(false)).await;
    assert!(matches!(result, Err(filelock::Error::Timeout(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_with_lock_runs_closure_while_held() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AsyncExclusiveLock::new(dir.path().join("a.lock")).unwrap();
    let locked_inside = lock.with_lock(|| lock.is_locked()).await.unwrap();
    assert!(locked_inside);
    assert!(!lock.is_locked());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_rw_readers_then_writer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rw.lock");
    let rw = AsyncReadWriteLock::new(&path).unwrap();

    {
        let _read_guard = rw.read(None, None).await.unwrap();
        assert!(rw.is_locked());
    }
    assert!(!rw.is_locked());

    let writer = AsyncReadWriteLock::new(&path).unwrap();
    let reader = AsyncReadWriteLock::new(&path).unwrap();

    let _write_guard = writer.write(None, None).await.unwrap();
    let blocked = reader.read(None, Some(false)).await;
    assert!(matches!(blocked, Err(filelock::Error::Timeout(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_default_is_not_thread_local() {
    let dir = tempfile::tempdir().unwrap();
    let lock = AsyncExclusiveLock::new(dir.path().join("a.lock")).unwrap();
    assert!(!lock.is_thread_local());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_acquire_timeout_bounds_wait() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.lock");
    let holder = AsyncExclusiveLock::new(&path).unwrap();
    let _guard = holder.acquire(None, None).await.unwrap();

    let waiter = AsyncExclusiveLock::new(&path).unwrap();
    let started = std::time::Instant::now();
    let result = waiter
        .acquire(Some(Some(Duration::from_millis(200))), None)
        .await;
    assert!(matches!(result, Err(filelock::Error::Timeout(_))));
    assert!(started.elapsed() < Duration::from_secs(2));
}
