//! Wait lists: counting semaphores whose waiters are tasklets
//!
//! A tasklet "blocks" by registering itself with [WaitList::down] or
//! [WaitList::wait] and returning from its handler. Whenever credit shows
//! up the head of the list is rescheduled and re-runs its handler, which
//! calls `down` again to find out whether it got what it wanted.
//!
//! The head is the only tasklet that gets woken by [WaitList::up]. When it
//! leaves the list while credit remains, the new head is woken in turn.
//!
//! Removing a tasklet from its list ([Tasklet::unwait]) needs the list's
//! lock, which ranks before the tasklet's `wait_mutex`. The remover drops
//! `wait_mutex` to take the list lock and registers in `unwaiting` while it
//! does, so the list knows it must not go away under it.

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::Level;

use crate::atomic_lock::Condition;
use crate::owned_lock::OwnedLock;
use crate::tasklet::{clone_linked, list, wait_link, Tasklet};
use crate::util::UsizePtr;

enum WaitHead {
    /// Circular list of waiters, strong references
    Idle(*const Tasklet),
    /// The list is being torn down, late removers signal this when done
    Draining(Arc<Condition>),
}

struct WaitListState {
    head: WaitHead,
    credit: usize,
    /// Removers that have let go of a tasklet's `wait_mutex` to come and
    /// take this list's lock
    unwaiting: usize,
}

impl WaitListState {
    fn head(&mut self) -> &mut *const Tasklet {
        match &mut self.head {
            WaitHead::Idle(h) => h,
            WaitHead::Draining(_) => panic!("wait list used while being torn down"),
        }
    }
}

/// The part of a wait list tasklets point at
///
/// Lives in its own allocation, freed by [WaitList]'s drop only once no
/// remover can still reach it.
pub(crate) struct Shared {
    lock: OwnedLock,
    state: UnsafeCell<WaitListState>,
}

impl Shared {
    /// # Safety
    ///
    /// The caller holds `self.lock` and keeps no other state reference alive.
    #[allow(clippy::mut_from_ref)]
    unsafe fn state(&self) -> &mut WaitListState {
        &mut *self.state.get()
    }

    fn as_ptr(&self) -> *mut Shared {
        self as *const Shared as *mut Shared
    }

    /// Link `t`, waking it if it is alone and credit is available
    ///
    /// Caller holds `self.lock` and `t.wait_mutex`, and `t` is on no list.
    unsafe fn add(&self, t: &Arc<Tasklet>) {
        t.wait.store(self.as_ptr(), Ordering::Release);
        let st = self.state();
        let was_empty = st.head().is_null();
        list::push_tail(st.head(), Arc::into_raw(t.clone()), wait_link);
        if was_empty && st.credit > 0 {
            t.run();
        }
    }

    /// Unlink `t`, moving its pending removers over to the list
    ///
    /// Caller holds `self.lock` and `t.wait_mutex`, and `t` is linked here.
    /// Returns the list's reference to `t`.
    unsafe fn remove(&self, t: &Tasklet) -> Arc<Tasklet> {
        t.wait.store(ptr::null_mut(), Ordering::Release);
        let st = self.state();
        st.unwaiting += *t.unwaiting.get();
        *t.unwaiting.get() = 0;

        let was_head = ptr::eq(*st.head(), t);
        list::unlink(st.head(), t, wait_link);
        let new_head = *st.head();
        if was_head && !new_head.is_null() && st.credit > 0 {
            // pass the wakeup on
            clone_linked(new_head).run();
        }
        Arc::from_raw(t as *const Tasklet)
    }

    /// Caller holds `self.lock`
    unsafe fn broadcast_locked(&self) -> usize {
        let head = *self.state().head();
        if head.is_null() {
            return 0;
        }
        let mut n = 0;
        let mut t = head;
        loop {
            clone_linked(t).run();
            n += 1;
            t = list::next(t, wait_link);
            if ptr::eq(t, head) {
                return n;
            }
        }
    }
}

/// FIFO of tasklets waiting on a credit counter
///
/// Dropping the list reschedules every tasklet still on it, so none is
/// forgotten, and waits for removals in progress on other threads.
pub struct WaitList {
    shared: NonNull<Shared>,
}
// safety: all access to `shared` goes through its lock
unsafe impl Send for WaitList {}
unsafe impl Sync for WaitList {}

impl Debug for WaitList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitList")
            .field("ptr", &UsizePtr::from(self.shared.as_ptr()))
            .field("nonempty", &self.nonempty())
            .finish()
    }
}

impl WaitList {
    pub fn new(credit: usize) -> Arc<Self> {
        let shared = Box::new(Shared {
            lock: OwnedLock::new(),
            state: UnsafeCell::new(WaitListState {
                head: WaitHead::Idle(ptr::null()),
                credit,
                unwaiting: 0,
            }),
        });
        Arc::new(Self {
            shared: NonNull::from(Box::leak(shared)),
        })
    }

    fn shared(&self) -> &Shared {
        // safety: freed only in drop
        unsafe { self.shared.as_ref() }
    }

    /// Register `t` regardless of credit
    ///
    /// Moves `t` over from any other list it is on. Called from `t`'s
    /// handler, which should return afterwards.
    pub fn wait(&self, t: &Arc<Tasklet>) {
        let tracing_span = tracing::span!(Level::TRACE, "WaitList::wait", wl_ptr = ?UsizePtr::from(self.shared.as_ptr()), tasklet_ptr = ?UsizePtr::from(&**t));
        let _span_enter = tracing_span.enter();

        let w = self.shared();
        loop {
            w.lock.lock();
            t.wait_mutex.lock();
            let cur = t.wait.load(Ordering::Relaxed);
            let done = if cur.is_null() {
                // safety: both locks held
                unsafe { w.add(t) };
                true
            } else {
                ptr::eq(cur, w)
            };
            t.wait_mutex.unlock();
            w.lock.unlock();

            if done {
                break;
            }
            t.unwait();
        }
        t.waited.store(true, Ordering::Relaxed);
    }

    /// Try to take `n` units of credit for `t`
    ///
    /// Returns true if they were taken; `t` is then no longer registered
    /// here. Otherwise `t` is registered (if it was not already) and false
    /// is returned, and the handler should return and wait to be rerun.
    pub fn down(&self, n: usize, t: &Arc<Tasklet>) -> bool {
        let tracing_span = tracing::span!(Level::TRACE, "WaitList::down", wl_ptr = ?UsizePtr::from(self.shared.as_ptr()), tasklet_ptr = ?UsizePtr::from(&**t), n);
        let _span_enter = tracing_span.enter();

        let w = self.shared();
        loop {
            let mut removed = None;
            w.lock.lock();
            t.wait_mutex.lock();
            let cur = t.wait.load(Ordering::Relaxed);
            let res = if cur.is_null() || ptr::eq(cur, w) {
                // safety: both locks held
                unsafe {
                    let st = w.state();
                    if st.credit >= n {
                        st.credit -= n;
                        if !cur.is_null() {
                            removed = Some(w.remove(t));
                        }
                        Some(true)
                    } else {
                        if cur.is_null() {
                            w.add(t);
                        }
                        t.waited.store(true, Ordering::Relaxed);
                        Some(false)
                    }
                }
            } else {
                None
            };
            t.wait_mutex.unlock();
            w.lock.unlock();
            drop(removed);

            match res {
                Some(acquired) => {
                    tracing::event!(name: "wait_list::down", Level::TRACE, acquired);
                    return acquired;
                }
                None => t.unwait(),
            }
        }
    }

    /// Add `n` units of credit and wake the head waiter
    pub fn up(&self, n: usize) {
        let tracing_span = tracing::span!(Level::TRACE, "WaitList::up", wl_ptr = ?UsizePtr::from(self.shared.as_ptr()), n);
        let _span_enter = tracing_span.enter();

        let w = self.shared();
        w.lock.lock();
        // safety: lock held
        unsafe {
            let st = w.state();
            st.credit += n;
            let head = *st.head();
            if !head.is_null() {
                clone_linked(head).run();
            }
        }
        w.lock.unlock();
    }

    /// Replace the credit, optionally waking every waiter
    pub fn set(&self, n: usize, broadcast: bool) {
        let w = self.shared();
        w.lock.lock();
        // safety: lock held
        unsafe {
            w.state().credit = n;
            if broadcast {
                w.broadcast_locked();
            }
        }
        w.lock.unlock();
    }

    /// Reschedule every waiter, credit or not. Returns how many there were.
    pub fn broadcast(&self) -> usize {
        let w = self.shared();
        w.lock.lock();
        // safety: lock held
        let n = unsafe { w.broadcast_locked() };
        w.lock.unlock();
        tracing::event!(name: "wait_list::broadcast", Level::TRACE, n);
        n
    }

    pub fn nonempty(&self) -> bool {
        let w = self.shared();
        w.lock.lock();
        // safety: lock held
        let nonempty = unsafe { !w.state().head().is_null() };
        w.lock.unlock();
        nonempty
    }

    pub fn credit(&self) -> usize {
        let w = self.shared();
        w.lock.lock();
        // safety: lock held
        let credit = unsafe { w.state().credit };
        w.lock.unlock();
        credit
    }
}

impl Drop for WaitList {
    fn drop(&mut self) {
        let tracing_span = tracing::span!(Level::TRACE, "WaitList::drop", wl_ptr = ?UsizePtr::from(self.shared.as_ptr()));
        let _span_enter = tracing_span.enter();

        let w = self.shared();
        let mut released = Vec::new();
        w.lock.lock();
        // safety: lock held for everything below, except across cond_wait
        unsafe {
            while let Some(t) = list::pop_head(w.state().head(), wait_link) {
                let t = Arc::from_raw(t);
                t.run();

                t.wait_mutex.lock();
                let st = w.state();
                st.unwaiting += *t.unwaiting.get();
                *t.unwaiting.get() = 0;
                t.wait.store(ptr::null_mut(), Ordering::Release);
                t.wait_mutex.unlock();

                released.push(t);
            }

            // removers that already dropped a tasklet's wait_mutex still
            // need our lock once, let them have it
            if w.state().unwaiting > 0 {
                tracing::event!(name: "wait_list::draining", Level::TRACE, unwaiting = w.state().unwaiting);
                let cond = Arc::new(Condition::new());
                w.state().head = WaitHead::Draining(cond.clone());
                while w.state().unwaiting > 0 {
                    w.lock.cond_wait(&cond);
                }
                w.state().head = WaitHead::Idle(ptr::null());
            }
        }
        w.lock.unlock();
        drop(released);

        // safety: nobody can reach the shared part anymore
        drop(unsafe { Box::from_raw(self.shared.as_ptr()) });
    }
}

impl Tasklet {
    /// Take the tasklet off whatever wait list it is on
    pub(crate) fn unwait(&self) {
        let tracing_span = tracing::span!(Level::TRACE, "Tasklet::unwait", tasklet_ptr = ?UsizePtr::from(self));
        let _span_enter = tracing_span.enter();

        self.wait_mutex.lock();
        loop {
            let w = self.wait.load(Ordering::Relaxed);
            if w.is_null() {
                self.wait_mutex.unlock();
                return;
            }

            // safety: covered by wait_mutex
            unsafe { *self.unwaiting.get() += 1 };
            self.wait_mutex.unlock();
            // safety: our unwaiting count keeps the list from being freed
            let w = unsafe { &*w };
            w.lock.lock();
            self.wait_mutex.lock();

            if ptr::eq(self.wait.load(Ordering::Relaxed), w) {
                // safety: covered by wait_mutex
                unsafe { *self.unwaiting.get() -= 1 };
                // safety: both locks held, we are linked on w
                let removed = unsafe { w.remove(self) };
                self.wait_mutex.unlock();
                w.lock.unlock();
                drop(removed);
                return;
            }

            // we were taken off w meanwhile, and our count moved with us
            // safety: w's lock held
            unsafe {
                let st = w.state();
                st.unwaiting -= 1;
                if st.unwaiting == 0 {
                    if let WaitHead::Draining(cond) = &st.head {
                        cond.notify_all();
                    }
                }
            }
            w.lock.unlock();
        }
    }
}
