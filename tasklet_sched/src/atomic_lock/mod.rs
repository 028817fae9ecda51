//! Single word mutex with ownership transfer and veto
//!
//! The lock word is an `AtomicUsize`, bit packed as follows:
//! - `bits[0]` = locked
//! - `bits[1]` = there are threads parked in the waiter queue
//! - `bits[2]` = the waiter queue itself is locked (tiny spinlock)
//!
//! The uncontended case is a single CAS on acquire and on release.
//! Contended acquirers spin for a bit and then park themselves in a FIFO
//! next to the word. Release never clears the locked bit while someone is
//! parked, the lock is handed straight to the oldest waiter instead.
//!
//! A [AtomicLock::transfer] parks the caller on the destination lock *before*
//! releasing the source lock, so nobody can observe both locks free at once.
//! The holder of the destination can [AtomicLock::veto_pending_transfer],
//! which kicks every parked transfer out of the queue with a failure outcome.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;
#[cfg(not(loom))]
use std::time::Instant;

use tracing::Level;

use crate::loom_testing::*;
use crate::util::UsizePtr;

/// The lock is held
const LOCKED: usize = 1 << 0;
/// There is at least one thread in the waiter queue
const PARKED: usize = 1 << 1;
/// The waiter queue is being modified
const QUEUE_LOCKED: usize = 1 << 2;

/// Number of times to spin before parking the current thread
#[cfg(not(loom))]
const SPIN_LIMIT: usize = 40;
#[cfg(loom)]
const SPIN_LIMIT: usize = 1;

/// Decoded view of the lock word
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LockWord {
    Unlocked,
    LockedNoWaiters,
    LockedWithWaiters,
}
impl LockWord {
    fn decode(x: usize) -> Self {
        if x & LOCKED == 0 {
            Self::Unlocked
        } else if x & PARKED == 0 {
            Self::LockedNoWaiters
        } else {
            Self::LockedWithWaiters
        }
    }
}

/// Result of [AtomicLock::transfer]
#[must_use]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TransferOutcome {
    /// The caller now holds the destination, the source was released
    Transferred,
    /// A veto hit, the caller still (again) holds the source
    Vetoed,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum WaiterKind {
    Acquire,
    Transfer,
}

const PENDING: u8 = 0;
const GRANTED: u8 = 1;
const VETOED: u8 = 2;

/// One parked thread
struct Waiter {
    thread: thread::Thread,
    kind: WaiterKind,
    outcome: AtomicU8,
}
impl Waiter {
    fn new(kind: WaiterKind) -> Arc<Self> {
        Arc::new(Self {
            thread: thread::current(),
            kind,
            outcome: AtomicU8::new(PENDING),
        })
    }

    fn wake(&self, outcome: u8) {
        self.outcome.store(outcome, Ordering::Release);
        self.thread.unpark();
    }

    fn park(&self) -> u8 {
        loop {
            let outcome = self.outcome.load(Ordering::Acquire);
            if outcome != PENDING {
                return outcome;
            }
            thread::park();
        }
    }

    #[cfg(not(loom))]
    fn park_until(&self, deadline: Instant) -> Option<u8> {
        loop {
            let outcome = self.outcome.load(Ordering::Acquire);
            if outcome != PENDING {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::park_timeout(deadline - now);
        }
    }
}

/// Raw lock, see module docs
///
/// This is *not* a RAII guard. Callers pair [AtomicLock::acquire] and
/// [AtomicLock::release] themselves, possibly on different call paths
/// (e.g. a lock acquired by a run queue and released by a handler).
pub struct AtomicLock {
    word: AtomicUsize,
    /// Parked threads, oldest first. Only touched with [QUEUE_LOCKED] set.
    waiters: UnsafeCell<VecDeque<Arc<Waiter>>>,
}
// safety: `waiters` is only accessed while holding the queue bit
unsafe impl Send for AtomicLock {}
unsafe impl Sync for AtomicLock {}

impl Debug for AtomicLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicLock")
            .field("word", &self.word())
            .finish_non_exhaustive()
    }
}

impl Default for AtomicLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicLock {
    pub fn new() -> Self {
        Self {
            word: AtomicUsize::new(0),
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    /// Snapshot of the lock state, only meaningful for diagnostics and tests
    pub fn word(&self) -> LockWord {
        LockWord::decode(self.word.load(Ordering::Relaxed))
    }

    /// Number of parked threads
    #[cfg(test)]
    pub(crate) fn parked(&self) -> usize {
        self.lock_queue();
        // safety: queue bit held
        let n = unsafe { (*self.waiters.get()).len() };
        self.unlock_queue();
        n
    }

    /// Block until the lock is acquired
    pub fn acquire(&self) {
        if self
            .word
            .compare_exchange(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.acquire_slow();
    }

    fn acquire_slow(&self) {
        let tracing_span =
            tracing::span!(Level::TRACE, "AtomicLock::acquire_slow", lock_ptr = ?UsizePtr::from(self));
        let _span_enter = tracing_span.enter();

        let mut spins = 0;
        let mut old = self.word.load(Ordering::Relaxed);
        loop {
            if old & LOCKED == 0 {
                match self.word.compare_exchange_weak(
                    old,
                    old | LOCKED,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(x) => {
                        old = x;
                        spin_hint();
                        continue;
                    }
                }
            }
            if spins < SPIN_LIMIT && old & PARKED == 0 {
                spins += 1;
                spin_hint();
                old = self.word.load(Ordering::Relaxed);
                continue;
            }

            let waiter = Waiter::new(WaiterKind::Acquire);
            if !self.enqueue(&waiter) {
                // released while we were taking the queue
                old = self.word.load(Ordering::Relaxed);
                continue;
            }
            tracing::event!(name: "atomic_lock::park", Level::TRACE, "parking");
            let outcome = waiter.park();
            debug_assert_eq!(outcome, GRANTED);
            return;
        }
    }

    /// Acquire the lock if it is free, never blocks
    pub fn try_acquire(&self) -> bool {
        let mut old = self.word.load(Ordering::Relaxed);
        loop {
            if old & LOCKED != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                old,
                old | LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(x) => old = x,
            }
        }
    }

    /// Release the lock, handing it to the oldest parked thread if there is one
    ///
    /// The caller must hold the lock.
    pub fn release(&self) {
        if self
            .word
            .compare_exchange(LOCKED, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.release_slow();
    }

    fn release_slow(&self) {
        let tracing_span =
            tracing::span!(Level::TRACE, "AtomicLock::release_slow", lock_ptr = ?UsizePtr::from(self));
        let _span_enter = tracing_span.enter();

        let mut old = self.word.load(Ordering::Relaxed);
        loop {
            debug_assert!(old & LOCKED != 0, "releasing an unlocked AtomicLock");
            if old & PARKED == 0 {
                // the queue bit may be set by someone about to park, they
                // recheck the locked bit before committing
                match self.word.compare_exchange_weak(
                    old,
                    old & !LOCKED,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => return,
                    Err(x) => {
                        old = x;
                        continue;
                    }
                }
            }

            self.lock_queue();
            // safety: queue bit held
            let next = unsafe { (*self.waiters.get()).pop_front() };
            match next {
                Some(waiter) => {
                    // the locked bit stays set, ownership moves to `waiter`
                    self.unlock_queue();
                    tracing::event!(name: "atomic_lock::handoff", Level::TRACE, transfer = waiter.kind == WaiterKind::Transfer);
                    waiter.wake(GRANTED);
                    return;
                }
                None => {
                    self.unlock_queue();
                    old = self.word.load(Ordering::Relaxed);
                }
            }
        }
    }

    /// Move ownership from `self` to `to` with no unlocked window in between
    ///
    /// The caller must hold `self`. If `to` is busy the caller parks on it
    /// as a transfer waiter before `self` is released. A veto on `to` makes
    /// this return [TransferOutcome::Vetoed] with `self` held again and `to`
    /// untouched.
    pub fn transfer(&self, to: &AtomicLock) -> TransferOutcome {
        let tracing_span = tracing::span!(
            Level::TRACE,
            "AtomicLock::transfer",
            from_ptr = ?UsizePtr::from(self),
            to_ptr = ?UsizePtr::from(to)
        );
        let _span_enter = tracing_span.enter();

        loop {
            if to.try_acquire() {
                self.release();
                return TransferOutcome::Transferred;
            }

            let waiter = Waiter::new(WaiterKind::Transfer);
            if !to.enqueue(&waiter) {
                spin_hint();
                continue;
            }
            self.release();

            tracing::event!(name: "atomic_lock::park", Level::TRACE, "parking for transfer");
            return match waiter.park() {
                GRANTED => TransferOutcome::Transferred,
                _ => {
                    tracing::event!(name: "atomic_lock::vetoed", Level::TRACE, "transfer vetoed");
                    self.acquire();
                    TransferOutcome::Vetoed
                }
            };
        }
    }

    /// Fail every transfer currently parked on this lock
    ///
    /// Normally called by the holder of this lock. Returns how many transfers
    /// were vetoed. Transfers that park after this returns are unaffected.
    pub fn veto_pending_transfer(&self) -> usize {
        let tracing_span =
            tracing::span!(Level::TRACE, "AtomicLock::veto_pending_transfer", lock_ptr = ?UsizePtr::from(self));
        let _span_enter = tracing_span.enter();

        let mut vetoed = Vec::new();
        self.lock_queue();
        // safety: queue bit held
        unsafe {
            (*self.waiters.get()).retain(|w| {
                if w.kind == WaiterKind::Transfer {
                    vetoed.push(w.clone());
                    false
                } else {
                    true
                }
            });
        }
        self.unlock_queue();

        tracing::event!(name: "atomic_lock::veto", Level::TRACE, n = vetoed.len());
        for w in &vetoed {
            w.wake(VETOED);
        }
        vetoed.len()
    }

    /// Park `waiter` on this lock, provided it is still locked
    ///
    /// Returns false (and enqueues nothing) if the lock was found free.
    fn enqueue(&self, waiter: &Arc<Waiter>) -> bool {
        self.lock_queue();
        // once PARKED is set, release has to come through the queue
        let marked = self
            .word
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                if x & LOCKED != 0 {
                    Some(x | PARKED)
                } else {
                    None
                }
            })
            .is_ok();
        if marked {
            // safety: queue bit held
            unsafe { (*self.waiters.get()).push_back(waiter.clone()) };
        }
        self.unlock_queue();
        marked
    }

    fn lock_queue(&self) {
        let mut old = self.word.load(Ordering::Relaxed);
        loop {
            if old & QUEUE_LOCKED != 0 {
                spin_hint();
                old = self.word.load(Ordering::Relaxed);
                continue;
            }
            match self.word.compare_exchange_weak(
                old,
                old | QUEUE_LOCKED,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(x) => old = x,
            }
        }
    }

    /// Drop the queue bit, recomputing the parked bit from the queue contents
    fn unlock_queue(&self) {
        // safety: queue bit held
        let parked = unsafe { !(*self.waiters.get()).is_empty() };
        let _ = self
            .word
            .fetch_update(Ordering::Release, Ordering::Relaxed, |x| {
                let x = x & !(QUEUE_LOCKED | PARKED);
                Some(if parked { x | PARKED } else { x })
            });
    }
}

impl Drop for AtomicLock {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                self.word.load(Ordering::Relaxed) & LOCKED == 0,
                "dropping a held AtomicLock"
            );
        }
    }
}

/// Condition variable for code protected by an [AtomicLock]
///
/// Waiters register themselves before the user lock is dropped, so a notify
/// issued by the next holder of that lock cannot be lost.
pub struct Condition {
    lock: AtomicLock,
    /// Only touched while holding `lock`
    waiters: UnsafeCell<VecDeque<Arc<Waiter>>>,
}
// safety: `waiters` is covered by `lock`
unsafe impl Send for Condition {}
unsafe impl Sync for Condition {}

impl Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").finish_non_exhaustive()
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Self {
            lock: AtomicLock::new(),
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    fn register(&self) -> Arc<Waiter> {
        let waiter = Waiter::new(WaiterKind::Acquire);
        self.lock.acquire();
        // safety: covered by self.lock
        unsafe { (*self.waiters.get()).push_back(waiter.clone()) };
        self.lock.release();
        waiter
    }

    /// Release `lock`, sleep until notified, re-acquire `lock`
    ///
    /// Can wake spuriously, callers re-check their predicate in a loop.
    pub fn wait(&self, lock: &AtomicLock) {
        let waiter = self.register();
        lock.release();
        waiter.park();
        lock.acquire();
    }

    /// [Condition::wait] with a deadline, returns false on timeout
    #[cfg(not(loom))]
    pub fn wait_until(&self, lock: &AtomicLock, deadline: Instant) -> bool {
        let waiter = self.register();
        lock.release();
        let notified = match waiter.park_until(deadline) {
            Some(_) => true,
            None => {
                self.lock.acquire();
                // safety: covered by self.lock
                let still_queued = unsafe {
                    let waiters = &mut *self.waiters.get();
                    let before = waiters.len();
                    waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
                    waiters.len() != before
                };
                self.lock.release();
                // if we were no longer queued a notify got to us first
                !still_queued
            }
        };
        lock.acquire();
        notified
    }

    pub fn notify_one(&self) {
        self.lock.acquire();
        // safety: covered by self.lock
        let waiter = unsafe { (*self.waiters.get()).pop_front() };
        self.lock.release();
        if let Some(waiter) = waiter {
            waiter.wake(GRANTED);
        }
    }

    pub fn notify_all(&self) {
        self.lock.acquire();
        // safety: covered by self.lock
        let waiters = unsafe { std::mem::take(&mut *self.waiters.get()) };
        self.lock.release();
        for waiter in waiters {
            waiter.wake(GRANTED);
        }
    }
}

#[cfg(test)]
mod tests;
