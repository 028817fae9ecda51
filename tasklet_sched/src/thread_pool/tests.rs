use super::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(not(loom))]
#[test]
fn thread_pool_sums() {
    crate::util::init_test_tracing();
    let pool = ThreadPool::new(4).unwrap();
    let sum = Arc::new(AtomicUsize::new(0));
    for i in 1..=15 {
        let sum = sum.clone();
        pool.submit(move || {
            sum.fetch_add(i, Ordering::Relaxed);
        })
        .unwrap();
    }
    pool.destroy(true).unwrap();
    assert_eq!(sum.load(Ordering::Relaxed), 120);
}

#[cfg(not(loom))]
#[test]
fn thread_pool_graceful_drains_queue() {
    let pool = ThreadPool::new(1).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..50 {
        let done = done.clone();
        pool.submit(move || {
            std::thread::sleep(Duration::from_micros(100));
            done.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    pool.destroy(true).unwrap();
    assert_eq!(done.load(Ordering::Relaxed), 50);
}

#[cfg(not(loom))]
#[test]
fn thread_pool_immediate_drops_queue() {
    let pool = Arc::new(ThreadPool::new(1).unwrap());
    let ran = Arc::new(AtomicUsize::new(0));
    let blocking = Arc::new(AtomicBool::new(false));

    // occupies the only thread until the pool refuses new work
    {
        let (pool2, blocking) = (pool.clone(), blocking.clone());
        pool.submit(move || {
            blocking.store(true, Ordering::Release);
            let deadline = Instant::now() + Duration::from_secs(10);
            while pool2.submit(|| {}).is_ok() {
                assert!(Instant::now() < deadline);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();
    }
    while !blocking.load(Ordering::Acquire) {
        std::thread::yield_now();
    }
    for _ in 0..10 {
        let ran = ran.clone();
        pool.submit(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }

    pool.destroy(false).unwrap();
    assert_eq!(ran.load(Ordering::Relaxed), 0);
}

#[cfg(not(loom))]
#[test]
fn thread_pool_needs_a_thread() {
    assert_eq!(ThreadPool::new(0).unwrap_err(), ThreadPoolError::Invalid);
    assert_eq!(ThreadPoolError::Invalid.code(), -1);
}

#[cfg(not(loom))]
#[test]
fn thread_pool_use_after_destroy() {
    let pool = ThreadPool::new(2).unwrap();
    pool.destroy(true).unwrap();
    assert_eq!(pool.destroy(true), Err(ThreadPoolError::AlreadyShutDown));
    assert_eq!(pool.submit(|| {}), Err(ThreadPoolError::AlreadyShutDown));
}

#[cfg(not(loom))]
#[test]
fn thread_pool_drop_stops_threads() {
    let ran = Arc::new(AtomicUsize::new(0));
    {
        let pool = ThreadPool::new(3).unwrap();
        let ran = ran.clone();
        pool.submit(move || {
            ran.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
    }
    assert!(ran.load(Ordering::Relaxed) <= 1);
}
