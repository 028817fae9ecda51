use super::*;

#[cfg(not(loom))]
use std::time::Duration;

struct Counter(UnsafeCell<u64>);
// safety: only touched while holding the lock under test
unsafe impl Sync for Counter {}

#[cfg(not(loom))]
fn spin_until(mut f: impl FnMut() -> bool) {
    while !f() {
        std::thread::yield_now();
    }
}

#[cfg(loom)]
#[test]
fn atomic_lock_loom_mutual_exclusion() {
    loom::model(|| {
        let lock = &*Box::leak(Box::new(AtomicLock::new()));
        let counter = &*Box::leak(Box::new(Counter(UnsafeCell::new(0))));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                loom::thread::spawn(move || {
                    lock.acquire();
                    unsafe {
                        let v = *counter.0.get();
                        loom::thread::yield_now();
                        *counter.0.get() = v + 1;
                    }
                    lock.release();
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(unsafe { *counter.0.get() }, 2);
        assert_eq!(lock.word(), LockWord::Unlocked);
    });
}

#[cfg(loom)]
#[test]
fn atomic_lock_loom_transfer_vs_release() {
    loom::model(|| {
        let src = &*Box::leak(Box::new(AtomicLock::new()));
        let dst = &*Box::leak(Box::new(AtomicLock::new()));

        dst.acquire();
        let t1 = loom::thread::spawn(move || {
            src.acquire();
            let ret = src.transfer(dst);
            assert_eq!(ret, TransferOutcome::Transferred);
            dst.release();
        });
        loom::thread::yield_now();
        dst.release();
        t1.join().unwrap();

        assert_eq!(src.word(), LockWord::Unlocked);
        assert_eq!(dst.word(), LockWord::Unlocked);
    });
}

#[cfg(loom)]
#[test]
fn atomic_lock_loom_transfer_vs_veto() {
    loom::model(|| {
        let src = &*Box::leak(Box::new(AtomicLock::new()));
        let dst = &*Box::leak(Box::new(AtomicLock::new()));

        dst.acquire();
        let t1 = loom::thread::spawn(move || {
            src.acquire();
            match src.transfer(dst) {
                TransferOutcome::Transferred => dst.release(),
                TransferOutcome::Vetoed => src.release(),
            }
        });
        // either catches the transfer in the queue or misses it entirely
        let n = dst.veto_pending_transfer();
        assert!(n <= 1);
        dst.release();
        t1.join().unwrap();

        assert_eq!(src.word(), LockWord::Unlocked);
        assert_eq!(dst.word(), LockWord::Unlocked);
    });
}

#[cfg(not(loom))]
#[test]
fn atomic_lock_single_threaded_states() {
    let lock = AtomicLock::new();
    assert_eq!(lock.word(), LockWord::Unlocked);
    lock.acquire();
    assert_eq!(lock.word(), LockWord::LockedNoWaiters);
    assert!(!lock.try_acquire());
    lock.release();
    assert_eq!(lock.word(), LockWord::Unlocked);
    assert!(lock.try_acquire());
    lock.release();
}

#[cfg(not(loom))]
#[test]
fn atomic_lock_mutual_exclusion() {
    let lock = AtomicLock::new();
    let counter = Counter(UnsafeCell::new(0));

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let counter = &counter;
                for _ in 0..10000 {
                    lock.acquire();
                    unsafe {
                        *counter.0.get() += 1;
                    }
                    lock.release();
                }
            });
        }
    });

    assert_eq!(unsafe { *counter.0.get() }, 40000);
    assert_eq!(lock.word(), LockWord::Unlocked);
}

#[cfg(not(loom))]
#[test]
fn atomic_lock_transfer_fast_path() {
    let a = AtomicLock::new();
    let b = AtomicLock::new();
    a.acquire();
    assert_eq!(a.transfer(&b), TransferOutcome::Transferred);
    assert_eq!(a.word(), LockWord::Unlocked);
    assert_eq!(b.word(), LockWord::LockedNoWaiters);
    b.release();
}

#[cfg(not(loom))]
#[test]
fn atomic_lock_transfer_granted_on_release() {
    let a = AtomicLock::new();
    let b = AtomicLock::new();

    b.acquire();
    std::thread::scope(|s| {
        let t = s.spawn(|| {
            a.acquire();
            let ret = a.transfer(&b);
            if ret == TransferOutcome::Transferred {
                b.release();
            }
            ret
        });

        // `a` is only released once the transfer is parked on `b`
        spin_until(|| b.word() == LockWord::LockedWithWaiters);
        spin_until(|| a.word() == LockWord::Unlocked);
        b.release();

        assert_eq!(t.join().unwrap(), TransferOutcome::Transferred);
    });
    assert_eq!(a.word(), LockWord::Unlocked);
    assert_eq!(b.word(), LockWord::Unlocked);
}

#[cfg(not(loom))]
#[test]
fn atomic_lock_veto_restores_source() {
    crate::util::init_test_tracing();
    let a = AtomicLock::new();
    let b = AtomicLock::new();

    b.acquire();
    std::thread::scope(|s| {
        let t = s.spawn(|| {
            a.acquire();
            let ret = a.transfer(&b);
            // on veto we are holding `a` again
            assert!(!a.try_acquire());
            a.release();
            ret
        });

        spin_until(|| b.word() == LockWord::LockedWithWaiters);
        assert_eq!(b.veto_pending_transfer(), 1);
        assert_eq!(b.word(), LockWord::LockedNoWaiters);
        assert_eq!(t.join().unwrap(), TransferOutcome::Vetoed);

        // single shot, nothing left to veto
        assert_eq!(b.veto_pending_transfer(), 0);
        b.release();
    });
    assert_eq!(a.word(), LockWord::Unlocked);
}

#[cfg(not(loom))]
#[test]
fn atomic_lock_veto_ignores_plain_acquire() {
    let lock = AtomicLock::new();
    let got = AtomicBool::new(false);

    lock.acquire();
    std::thread::scope(|s| {
        s.spawn(|| {
            lock.acquire();
            got.store(true, Ordering::Relaxed);
            lock.release();
        });

        spin_until(|| lock.word() == LockWord::LockedWithWaiters);
        assert_eq!(lock.veto_pending_transfer(), 0);
        assert!(!got.load(Ordering::Relaxed));
        lock.release();
    });
    assert!(got.load(Ordering::Relaxed));
}

#[cfg(not(loom))]
#[test]
fn condition_wait_notify() {
    let lock = AtomicLock::new();
    let cond = Condition::new();
    let flag = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            lock.acquire();
            while !flag.load(Ordering::Relaxed) {
                cond.wait(&lock);
            }
            lock.release();
        });

        std::thread::sleep(Duration::from_millis(10));
        lock.acquire();
        flag.store(true, Ordering::Relaxed);
        cond.notify_all();
        lock.release();
    });
    assert_eq!(lock.word(), LockWord::Unlocked);
}

#[cfg(not(loom))]
#[test]
fn condition_wait_until_times_out() {
    let lock = AtomicLock::new();
    let cond = Condition::new();

    lock.acquire();
    let notified = cond.wait_until(&lock, Instant::now() + Duration::from_millis(20));
    assert!(!notified);
    // still holding the lock
    assert!(!lock.try_acquire());
    lock.release();

    // a later notify has nobody to wake
    cond.notify_one();
}
