//! [AtomicLock] plus a "somebody holds this" flag for fail-fast assertions

use std::fmt::Debug;
use std::sync::atomic::Ordering;
#[cfg(not(loom))]
use std::time::Instant;

use crate::atomic_lock::{AtomicLock, Condition, TransferOutcome};
use crate::loom_testing::*;

/// Mutex whose holder is tracked, so operations that require it can assert
///
/// `held` is only written by the thread that owns the lock at that moment.
/// It carries no owner identity, it exists to catch callers that forgot to
/// take the lock at all.
pub struct OwnedLock {
    raw: AtomicLock,
    held: AtomicBool,
}

impl Debug for OwnedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedLock")
            .field("raw", &self.raw)
            .field("held", &self.is_held())
            .finish()
    }
}

impl Default for OwnedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnedLock {
    pub fn new() -> Self {
        Self {
            raw: AtomicLock::new(),
            held: AtomicBool::new(false),
        }
    }

    pub fn lock(&self) {
        self.raw.acquire();
        self.held.store(true, Ordering::Relaxed);
    }

    pub fn try_lock(&self) -> bool {
        if self.raw.try_acquire() {
            self.held.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn unlock(&self) {
        self.assert_held();
        self.held.store(false, Ordering::Relaxed);
        self.raw.release();
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }

    #[track_caller]
    pub fn assert_held(&self) {
        assert!(self.is_held(), "lock is not held");
    }

    /// Hand ownership from `self` to `to`, see [AtomicLock::transfer]
    pub fn transfer(&self, to: &OwnedLock) -> TransferOutcome {
        self.assert_held();
        // cleared before the raw lock can end up with someone else
        self.held.store(false, Ordering::Relaxed);
        match self.raw.transfer(&to.raw) {
            TransferOutcome::Transferred => {
                to.held.store(true, Ordering::Relaxed);
                TransferOutcome::Transferred
            }
            TransferOutcome::Vetoed => {
                self.held.store(true, Ordering::Relaxed);
                TransferOutcome::Vetoed
            }
        }
    }

    /// Fail transfers parked on this lock, the caller must hold it
    pub fn veto_transfer(&self) -> usize {
        self.assert_held();
        self.raw.veto_pending_transfer()
    }

    pub fn cond_wait(&self, cond: &Condition) {
        self.assert_held();
        self.held.store(false, Ordering::Relaxed);
        cond.wait(&self.raw);
        self.held.store(true, Ordering::Relaxed);
    }

    /// Returns false if `deadline` passed without a notify
    #[cfg(not(loom))]
    pub fn cond_wait_until(&self, cond: &Condition, deadline: Instant) -> bool {
        self.assert_held();
        self.held.store(false, Ordering::Relaxed);
        let notified = cond.wait_until(&self.raw, deadline);
        self.held.store(true, Ordering::Relaxed);
        notified
    }

    pub fn raw(&self) -> &AtomicLock {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic_lock::LockWord;

    #[cfg(not(loom))]
    #[test]
    fn owned_lock_tracks_holder() {
        let l = OwnedLock::new();
        assert!(!l.is_held());
        l.lock();
        assert!(l.is_held());
        assert!(!l.try_lock());
        l.unlock();
        assert!(!l.is_held());
        assert_eq!(l.raw().word(), LockWord::Unlocked);
    }

    #[cfg(not(loom))]
    #[test]
    #[should_panic(expected = "lock is not held")]
    fn owned_lock_unlock_unheld_panics() {
        let l = OwnedLock::new();
        l.unlock();
    }

    #[cfg(not(loom))]
    #[test]
    fn owned_lock_transfer_moves_flag() {
        let a = OwnedLock::new();
        let b = OwnedLock::new();
        a.lock();
        assert_eq!(a.transfer(&b), TransferOutcome::Transferred);
        assert!(!a.is_held());
        assert!(b.is_held());
        b.unlock();
    }

    #[cfg(not(loom))]
    #[test]
    fn owned_lock_vetoed_transfer_keeps_source() {
        let a = OwnedLock::new();
        let b = OwnedLock::new();

        b.lock();
        std::thread::scope(|s| {
            let t = s.spawn(|| {
                a.lock();
                let ret = a.transfer(&b);
                assert!(a.is_held());
                a.unlock();
                ret
            });

            while b.raw().word() != LockWord::LockedWithWaiters {
                std::thread::yield_now();
            }
            assert_eq!(b.veto_transfer(), 1);
            assert_eq!(t.join().unwrap(), TransferOutcome::Vetoed);
        });
        assert!(b.is_held());
        b.unlock();
    }

    #[cfg(not(loom))]
    #[test]
    fn owned_lock_cond_wait_until() {
        use std::time::Duration;

        let l = OwnedLock::new();
        let cond = Condition::new();

        l.lock();
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(!l.cond_wait_until(&cond, deadline));
        assert!(l.is_held());
        assert!(Instant::now() >= deadline);

        let ready = AtomicBool::new(false);
        std::thread::scope(|s| {
            s.spawn(|| {
                l.lock();
                ready.store(true, Ordering::Relaxed);
                cond.notify_all();
                l.unlock();
            });
            let deadline = Instant::now() + Duration::from_secs(10);
            while !ready.load(Ordering::Relaxed) {
                assert!(l.cond_wait_until(&cond, deadline));
            }
        });
        assert!(l.is_held());
        l.unlock();
    }

    #[cfg(loom)]
    #[test]
    fn owned_lock_loom_handoff() {
        loom::model(|| {
            let a = &*Box::leak(Box::new(OwnedLock::new()));
            let b = &*Box::leak(Box::new(OwnedLock::new()));

            a.lock();
            let t1 = loom::thread::spawn(move || {
                b.lock();
                assert!(b.is_held());
                b.unlock();
            });
            assert_eq!(a.transfer(b), TransferOutcome::Transferred);
            assert!(b.is_held());
            b.unlock();
            t1.join().unwrap();

            assert!(!a.is_held());
            assert!(!b.is_held());
        });
    }
}
