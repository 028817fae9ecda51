//! Tasklets: handlers that run on a run queue with their owning lock held
//!
//! A tasklet never blocks the OS thread it runs on. To wait for something
//! the handler registers the tasklet on a [crate::WaitList] and returns; it
//! will be invoked again (from the top) once it is rescheduled.
//!
//! Lock order, outermost first:
//! owning lock, wait list lock, `wait_mutex`, run queue lock.
//! The run queue drains tasklets in the opposite direction (queue lock, then
//! owning lock) and gets away with it only through [OwnedLock::transfer].

use std::cell::UnsafeCell;
use std::fmt::Debug;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::Level;

use crate::atomic_lock::AtomicLock;
use crate::loom_testing::*;
use crate::owned_lock::OwnedLock;
use crate::run_queue::{global, CurrentState, RunQueue};
use crate::util::UsizePtr;
use crate::wait_list::Shared as WaitListShared;

pub(crate) mod list;
use list::Link;

/// Tasklet body
///
/// Gets the tasklet itself, so it can re-register on wait lists, swap its
/// handler or stop itself. Any other state lives in the closure's captures.
pub type Handler = Arc<dyn Fn(&Arc<Tasklet>) + Send + Sync>;

/// Handler storage
///
/// Writers normally hold the owning lock, but [Tasklet::defer] does not
/// have to, so the slot carries its own short lock.
struct HandlerSlot {
    lock: AtomicLock,
    handler: UnsafeCell<Option<Handler>>,
}
// safety: `handler` is covered by `lock`
unsafe impl Send for HandlerSlot {}
unsafe impl Sync for HandlerSlot {}

impl HandlerSlot {
    fn new() -> Self {
        Self {
            lock: AtomicLock::new(),
            handler: UnsafeCell::new(None),
        }
    }

    fn get(&self) -> Option<Handler> {
        self.lock.acquire();
        // safety: covered by self.lock
        let h = unsafe { (*self.handler.get()).clone() };
        self.lock.release();
        h
    }

    /// Returns the previous handler, dropped by the caller outside the slot lock
    fn replace(&self, h: Option<Handler>) -> Option<Handler> {
        self.lock.acquire();
        // safety: covered by self.lock
        let old = unsafe { std::mem::replace(&mut *self.handler.get(), h) };
        self.lock.release();
        old
    }
}

pub struct Tasklet {
    /// Held whenever the handler runs
    pub(crate) lock: Arc<OwnedLock>,
    handler: HandlerSlot,
    /// Guards `wait` transitions and `unwaiting`
    pub(crate) wait_mutex: OwnedLock,
    /// Wait list we are linked on, only changed with both the list's lock
    /// and `wait_mutex` held
    pub(crate) wait: AtomicPtr<WaitListShared>,
    /// Threads currently trying to take us off `wait`, covered by `wait_mutex`
    pub(crate) unwaiting: UnsafeCell<usize>,
    /// Set by the handler registering on a wait list, reset before every run
    pub(crate) waited: AtomicBool,
    /// Covered by the lock of the wait list in `wait`
    pub(crate) wait_link: UnsafeCell<Link>,
    /// Run queue we belong to, changed only under that queue's lock
    pub(crate) runq: AtomicPtr<RunQueue>,
    /// Covered by the lock of the queue in `runq`
    pub(crate) runq_link: UnsafeCell<Link>,
}
// safety: every UnsafeCell above is covered by the lock named on it
unsafe impl Send for Tasklet {}
unsafe impl Sync for Tasklet {}

impl Debug for Tasklet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tasklet")
            .field("lock", &UsizePtr::from(&*self.lock))
            .field("runq", &UsizePtr::from(self.runq.load(Ordering::Relaxed)))
            .field("wait", &UsizePtr::from(self.wait.load(Ordering::Relaxed)))
            .field("waited", &self.waited.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

pub(crate) unsafe fn runq_link(t: *const Tasklet) -> *mut Link {
    (*t).runq_link.get()
}

pub(crate) unsafe fn wait_link(t: *const Tasklet) -> *mut Link {
    (*t).wait_link.get()
}

/// Take an extra strong reference to a tasklet that a list holds one for
///
/// # Safety
///
/// `t` must have come from [Arc::into_raw] and still be owned by a list.
pub(crate) unsafe fn clone_linked(t: *const Tasklet) -> Arc<Tasklet> {
    Arc::increment_strong_count(t);
    Arc::from_raw(t)
}

impl Tasklet {
    /// Create a tasklet that runs with `lock` held
    ///
    /// Several tasklets may share one lock.
    pub fn new(lock: Arc<OwnedLock>) -> Arc<Self> {
        let t = Arc::new(Self {
            lock,
            handler: HandlerSlot::new(),
            wait_mutex: OwnedLock::new(),
            wait: AtomicPtr::new(ptr::null_mut()),
            unwaiting: UnsafeCell::new(0),
            waited: AtomicBool::new(false),
            wait_link: UnsafeCell::new(Link::new()),
            runq: AtomicPtr::new(ptr::null_mut()),
            runq_link: UnsafeCell::new(Link::new()),
        });
        tracing::event!(name: "tasklet::new", Level::TRACE, tasklet_ptr = ?UsizePtr::from(&*t));
        t
    }

    pub fn lock(&self) -> &Arc<OwnedLock> {
        &self.lock
    }

    /// Replace the handler, the owning lock must be held
    pub fn set_handler<F>(&self, f: F)
    where
        F: Fn(&Arc<Tasklet>) + Send + Sync + 'static,
    {
        self.lock.assert_held();
        drop(self.handler.replace(Some(Arc::new(f))));
    }

    /// Replace the handler and call it right here, the owning lock must be held
    pub fn goto<F>(self: &Arc<Self>, f: F)
    where
        F: Fn(&Arc<Tasklet>) + Send + Sync + 'static,
    {
        self.lock.assert_held();
        let h: Handler = Arc::new(f);
        drop(self.handler.replace(Some(h.clone())));
        h(self);
    }

    /// Replace the handler and schedule the tasklet, no lock required
    pub fn defer<F>(self: &Arc<Self>, f: F)
    where
        F: Fn(&Arc<Tasklet>) + Send + Sync + 'static,
    {
        drop(self.handler.replace(Some(Arc::new(f))));
        self.run();
    }

    /// [Tasklet::defer] onto a specific queue rather than the thread's preferred one
    pub(crate) fn defer_on<F>(self: &Arc<Self>, queue: &Arc<RunQueue>, f: F)
    where
        F: Fn(&Arc<Tasklet>) + Send + Sync + 'static,
    {
        drop(self.handler.replace(Some(Arc::new(f))));
        self.run_with(|| queue.clone());
    }

    pub(crate) fn handler(&self) -> Option<Handler> {
        self.handler.get()
    }

    pub fn is_scheduled(&self) -> bool {
        !self.runq.load(Ordering::Acquire).is_null()
    }

    pub fn is_waiting(&self) -> bool {
        !self.wait.load(Ordering::Acquire).is_null()
    }

    /// Make the tasklet runnable
    ///
    /// Idempotent: a tasklet already queued stays where it is, and one whose
    /// handler is running right now gets run once more after it returns.
    /// The owning lock does not need to be held.
    ///
    /// # Panics
    ///
    /// If the thread has no preferred queue and the default queue's worker
    /// cannot be started.
    pub fn run(self: &Arc<Self>) {
        self.run_with(global::thread_run_queue);
    }

    pub(crate) fn run_with(self: &Arc<Self>, pick: impl Fn() -> Arc<RunQueue>) {
        let tracing_span = tracing::span!(Level::TRACE, "Tasklet::run", tasklet_ptr = ?UsizePtr::from(&**self));
        let _span_enter = tracing_span.enter();

        loop {
            let q = self.runq.load(Ordering::Acquire);
            if q.is_null() {
                let q = pick();
                q.lock.lock();
                if self
                    .runq
                    .compare_exchange(
                        ptr::null_mut(),
                        Arc::as_ptr(&q) as *mut RunQueue,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::event!(name: "tasklet::enqueue", Level::TRACE, runq_ptr = ?UsizePtr::from(&*q));
                    // safety: queue lock held
                    unsafe { q.enqueue_locked(self.clone()) };
                    q.lock.unlock();
                    return;
                }
                q.lock.unlock();
            } else {
                // safety: run queues outlive every tasklet pointing at them
                let q = unsafe { &*q };
                q.lock.lock();
                if ptr::eq(self.runq.load(Ordering::Relaxed), q) {
                    // safety: queue lock held
                    let st = unsafe { q.state() };
                    if ptr::eq(st.current, &**self) {
                        tracing::event!(name: "tasklet::requeue", Level::TRACE, "running, will requeue");
                        st.current_state = CurrentState::Requeue;
                    }
                    q.lock.unlock();
                    return;
                }
                q.lock.unlock();
            }
        }
    }

    /// Take the tasklet off its wait list and run queue
    ///
    /// The owning lock must be held. When this returns the handler is not
    /// running on another thread and will not start unless rescheduled.
    /// Calling it from inside the handler marks the running invocation as
    /// the last one.
    pub fn stop(&self) {
        let tracing_span = tracing::span!(Level::TRACE, "Tasklet::stop", tasklet_ptr = ?UsizePtr::from(self));
        let _span_enter = tracing_span.enter();

        self.lock.assert_held();
        self.unwait();
        self.leave_run_queue(false);
    }

    /// [Tasklet::stop], then drop the handler
    ///
    /// May be called from inside the handler, in which case the run queue
    /// forgets about the tasklet immediately and the handler becomes
    /// responsible for unlocking the owning lock itself.
    pub fn fini(&self) {
        let tracing_span = tracing::span!(Level::TRACE, "Tasklet::fini", tasklet_ptr = ?UsizePtr::from(self));
        let _span_enter = tracing_span.enter();

        self.lock.assert_held();
        self.unwait();
        self.leave_run_queue(true);
        drop(self.handler.replace(None));
    }

    fn leave_run_queue(&self, finalizing: bool) {
        loop {
            let q = self.runq.load(Ordering::Acquire);
            if q.is_null() {
                return;
            }
            // safety: run queues outlive every tasklet pointing at them
            let q = unsafe { &*q };
            q.lock.lock();
            if !ptr::eq(self.runq.load(Ordering::Relaxed), q) {
                q.lock.unlock();
                continue;
            }

            // safety: queue lock held
            let st = unsafe { q.state() };
            if !ptr::eq(st.current, self) {
                // safety: queue lock held, we are linked on q
                let removed = unsafe { q.unlink_locked(self) };
                self.runq.store(ptr::null_mut(), Ordering::Release);
                q.lock.unlock();
                tracing::event!(name: "tasklet::dequeued", Level::TRACE, "removed from run queue");
                drop(removed);
                return;
            }

            st.current_state = CurrentState::Stopped;
            if st.thread == Some(thread::current().id()) {
                // called by our own handler
                if finalizing {
                    st.current = ptr::null();
                    self.runq.store(ptr::null_mut(), Ordering::Release);
                }
                q.lock.unlock();
                return;
            }

            // the queue is about to hand our lock to the handler, which
            // cannot happen while we hold it, so its transfer is parked
            self.lock.veto_transfer();
            loop {
                // safety: queue lock held
                let st = unsafe { q.state() };
                if !ptr::eq(st.current, self) {
                    break;
                }
                st.stop_waiting = true;
                q.lock.cond_wait(&q.cond);
            }
            q.lock.unlock();
            // someone may have called run() meanwhile, look again
        }
    }
}

impl Drop for Tasklet {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(
                self.runq.load(Ordering::Relaxed).is_null(),
                "tasklet dropped while on a run queue"
            );
            debug_assert!(
                self.wait.load(Ordering::Relaxed).is_null(),
                "tasklet dropped while on a wait list"
            );
        }
    }
}
