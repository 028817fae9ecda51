//! Run queues and the loop that drains them
//!
//! A run queue is a circular list of runnable tasklets plus the one being
//! run right now (`current`). It is served by at most one thread at a time,
//! usually a [Worker], but any thread can drain a queue with
//! [RunQueue::run].

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::Level;

use crate::atomic_lock::{Condition, TransferOutcome};
use crate::loom_testing::*;
use crate::owned_lock::OwnedLock;
use crate::tasklet::{list, runq_link, Tasklet};
use crate::util::UsizePtr;

pub mod global;
mod worker;

pub use worker::Worker;

/// What should happen to `current` once its handler returns
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CurrentState {
    /// Nothing requested, the handler has to have parked on a wait list
    Started,
    /// Detach from the queue
    Stopped,
    /// Put it back at the tail
    Requeue,
}

pub(crate) struct RunQueueState {
    /// Strong references, see [RunQueue::enqueue_locked]
    pub(crate) head: *const Tasklet,
    pub(crate) current: *const Tasklet,
    pub(crate) current_state: CurrentState,
    /// Someone is draining the queue
    pub(crate) serving: bool,
    /// Threads in [RunQueue::run] waiting for work
    pub(crate) idle_servers: usize,
    /// A stop is waiting for `current` to change
    pub(crate) stop_waiting: bool,
    /// Thread draining the queue, valid while `serving`
    pub(crate) thread: Option<thread::ThreadId>,
}

pub struct RunQueue {
    pub(crate) lock: OwnedLock,
    state: UnsafeCell<RunQueueState>,
    /// Idle servers and stop requests both sleep here
    pub(crate) cond: Condition,
    /// Registry link, see [global]
    pub(crate) registry_next: std::sync::atomic::AtomicPtr<RunQueue>,
}
// safety: `state` is covered by `lock`
unsafe impl Send for RunQueue {}
unsafe impl Sync for RunQueue {}

impl Debug for RunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunQueue")
            .field("ptr", &UsizePtr::from(self))
            .field("lock", &self.lock)
            .finish_non_exhaustive()
    }
}

impl RunQueue {
    pub(crate) fn new_unregistered() -> Arc<Self> {
        Arc::new(Self {
            lock: OwnedLock::new(),
            state: UnsafeCell::new(RunQueueState {
                head: ptr::null(),
                current: ptr::null(),
                current_state: CurrentState::Started,
                serving: false,
                idle_servers: 0,
                stop_waiting: false,
                thread: None,
            }),
            cond: Condition::new(),
            registry_next: std::sync::atomic::AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Create a run queue
    ///
    /// Queues stay allocated until [global::shutdown], since tasklets refer
    /// to their queue without holding any lock.
    pub fn create() -> Arc<Self> {
        let q = Self::new_unregistered();
        global::register(&q);
        q
    }

    /// # Safety
    ///
    /// The caller holds `self.lock` and does not keep another reference
    /// from this function alive at the same time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state(&self) -> &mut RunQueueState {
        &mut *self.state.get()
    }

    /// True if nothing is queued or running
    pub fn is_idle(&self) -> bool {
        self.lock.lock();
        // safety: lock held
        let st = unsafe { self.state() };
        let idle = st.head.is_null() && st.current.is_null();
        self.lock.unlock();
        idle
    }

    /// Append `t`, which must already point at this queue
    ///
    /// The list keeps `t`'s strong reference until it is popped or unlinked.
    ///
    /// # Safety
    ///
    /// `self.lock` is held.
    pub(crate) unsafe fn enqueue_locked(&self, t: Arc<Tasklet>) {
        debug_assert!(ptr::eq(t.runq.load(Ordering::Relaxed), self));
        let st = self.state();
        list::push_tail(&mut st.head, Arc::into_raw(t), runq_link);
        if st.idle_servers > 0 {
            self.cond.notify_all();
        }
    }

    /// Unlink a queued (not running) tasklet, returning the list's reference
    ///
    /// # Safety
    ///
    /// `self.lock` is held and `t` is linked on this queue.
    pub(crate) unsafe fn unlink_locked(&self, t: *const Tasklet) -> Arc<Tasklet> {
        let st = self.state();
        list::unlink(&mut st.head, t, runq_link);
        Arc::from_raw(t)
    }

    /// Serve the queue: run tasklets until it is empty
    ///
    /// With `wait` set, an empty queue (or one that another thread is
    /// already serving) is waited on. Otherwise this returns immediately.
    pub fn run(&self, wait: bool) {
        let tracing_span = tracing::span!(Level::TRACE, "RunQueue::run", runq_ptr = ?UsizePtr::from(self), wait);
        let _span_enter = tracing_span.enter();

        self.lock.lock();
        loop {
            // safety: lock held
            let st = unsafe { self.state() };
            if !st.head.is_null() && !st.serving {
                break;
            }
            if !wait {
                self.lock.unlock();
                return;
            }
            st.idle_servers += 1;
            self.lock.cond_wait(&self.cond);
            // safety: lock held
            unsafe { self.state() }.idle_servers -= 1;
        }

        {
            // safety: lock held
            let st = unsafe { self.state() };
            st.serving = true;
            st.thread = Some(thread::current().id());
        }

        loop {
            // safety: lock held, the list's reference moves into `t`
            let t = match unsafe { list::pop_head(&mut self.state().head, runq_link) } {
                Some(p) => unsafe { Arc::from_raw(p) },
                None => break,
            };
            // safety: lock held
            unsafe { self.state() }.current = Arc::as_ptr(&t);
            t.waited.store(false, Ordering::Relaxed);

            let transferred = loop {
                // safety: lock held
                unsafe { self.state() }.current_state = CurrentState::Started;
                match self.lock.transfer(&t.lock) {
                    TransferOutcome::Transferred => break true,
                    TransferOutcome::Vetoed => {
                        // a veto meant for another tasklet sharing this lock
                        // leaves our state alone, try again
                        // safety: lock held again
                        if unsafe { self.state() }.current_state != CurrentState::Started {
                            break false;
                        }
                    }
                }
            };

            if transferred {
                let Some(handler) = t.handler() else {
                    panic!("tasklet {:?} scheduled without a handler", UsizePtr::from(&*t));
                };
                tracing::event!(name: "run_queue::invoke", Level::TRACE, tasklet_ptr = ?UsizePtr::from(&*t));
                handler(&t);
                drop(handler);

                self.lock.lock();
                // safety: lock held
                let st = unsafe { self.state() };
                if ptr::eq(st.current, &*t) {
                    match st.current_state {
                        CurrentState::Started => {
                            assert!(
                                t.waited.load(Ordering::Relaxed) && t.is_waiting(),
                                "tasklet {:?} fell off the end of its handler without stopping or waiting",
                                UsizePtr::from(&*t)
                            );
                            t.runq.store(ptr::null_mut(), Ordering::Release);
                        }
                        CurrentState::Stopped => {
                            t.runq.store(ptr::null_mut(), Ordering::Release);
                        }
                        CurrentState::Requeue => {
                            tracing::event!(name: "run_queue::requeue", Level::TRACE, tasklet_ptr = ?UsizePtr::from(&*t));
                            // safety: lock held
                            unsafe { self.enqueue_locked(t.clone()) };
                        }
                    }
                    t.lock.unlock();
                }
                // otherwise it was finalized by its own handler, which
                // also took over its lock
            } else {
                // safety: lock held
                match unsafe { self.state() }.current_state {
                    CurrentState::Requeue => {
                        // safety: lock held
                        unsafe { self.enqueue_locked(t.clone()) };
                    }
                    _ => {
                        tracing::event!(name: "run_queue::skip_stopped", Level::TRACE, tasklet_ptr = ?UsizePtr::from(&*t));
                        t.runq.store(ptr::null_mut(), Ordering::Release);
                    }
                }
            }
            // safety: lock held
            let st = unsafe { self.state() };
            st.current = ptr::null();
            if st.stop_waiting {
                st.stop_waiting = false;
                self.cond.notify_all();
            }

            // the last reference may drop handler captures that take locks
            // ranking before ours, so it goes with the queue unlocked
            self.lock.unlock();
            drop(t);
            self.lock.lock();
        }

        {
            // safety: lock held
            let st = unsafe { self.state() };
            st.serving = false;
            st.thread = None;
        }
        self.lock.unlock();
    }
}

impl Drop for RunQueue {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            let st = self.state.get_mut();
            assert!(st.head.is_null(), "run queue dropped with tasklets queued");
            assert!(st.current.is_null(), "run queue dropped while running");
        }
    }
}
