//! Process wide scheduler state
//!
//! - a registry of every run queue ever created, holding one strong
//!   reference each until [shutdown]
//! - the default run queue and its worker, created on first use
//! - the calling thread's preferred run queue
//!
//! These are plain `std` statics even under loom, they are not part of any
//! model.

use std::cell::RefCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use tracing::Level;

use super::worker::Worker;
use super::RunQueue;
use crate::error::SchedulerError;
use crate::util::UsizePtr;

/// Lock-free push-only list threaded through [RunQueue::registry_next]
static REGISTRY: AtomicPtr<RunQueue> = AtomicPtr::new(ptr::null_mut());
/// Strong reference from [Arc::into_raw], published once
static DEFAULT_QUEUE: AtomicPtr<RunQueue> = AtomicPtr::new(ptr::null_mut());
static DEFAULT_WORKER: Mutex<Option<Worker>> = Mutex::new(None);

thread_local! {
    static PREFERRED: RefCell<Option<Arc<RunQueue>>> = RefCell::new(None);
}

/// Keep `q` alive until [shutdown]
pub(crate) fn register(q: &Arc<RunQueue>) {
    let p = Arc::into_raw(q.clone()) as *mut RunQueue;
    let mut head = REGISTRY.load(Ordering::Relaxed);
    loop {
        q.registry_next.store(head, Ordering::Relaxed);
        match REGISTRY.compare_exchange_weak(head, p, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => break,
            Err(x) => head = x,
        }
    }
    tracing::event!(name: "run_queue::register", Level::DEBUG, runq_ptr = ?UsizePtr::from(p));
}

/// Make `q` the queue [crate::Tasklet::run] picks on this thread
///
/// `None` goes back to the default queue.
pub fn set_preferred(q: Option<Arc<RunQueue>>) {
    PREFERRED.with(|p| *p.borrow_mut() = q);
}

pub(crate) fn thread_run_queue() -> Arc<RunQueue> {
    if let Some(q) = PREFERRED.with(|p| p.borrow().clone()) {
        return q;
    }
    match default_run_queue() {
        Ok(q) => q,
        Err(e) => panic!("cannot start the default run queue: {}", e),
    }
}

/// The default run queue, created along with its worker on first use
pub fn default_run_queue() -> Result<Arc<RunQueue>, SchedulerError> {
    loop {
        let p = DEFAULT_QUEUE.load(Ordering::Acquire);
        if !p.is_null() {
            // safety: DEFAULT_QUEUE owns a strong reference until shutdown
            unsafe {
                Arc::increment_strong_count(p);
                return Ok(Arc::from_raw(p));
            }
        }

        let q = RunQueue::new_unregistered();
        // the worker goes first, so a queue is only ever published with
        // somebody serving it
        let worker = Worker::spawn(q.clone())?;
        let raw = Arc::into_raw(q.clone()) as *mut RunQueue;
        match DEFAULT_QUEUE.compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                register(&q);
                let mut slot = DEFAULT_WORKER.lock().unwrap_or_else(|e| e.into_inner());
                *slot = Some(worker);
                tracing::event!(name: "run_queue::default_created", Level::DEBUG, runq_ptr = ?UsizePtr::from(raw));
                return Ok(q);
            }
            Err(_) => {
                // lost the race
                // safety: never published, this is our own reference
                drop(unsafe { Arc::from_raw(raw) });
                // somebody else's queue is published, ours never ran anything
                if let Err(e) = worker.shutdown() {
                    tracing::error!(error = %e, "spare default worker failed to stop");
                }
            }
        }
    }
}

/// Stop the default worker and release every registered run queue
///
/// Must not race with anything that schedules tasklets. All queues must be
/// idle by now (no tasklet queued or running), otherwise this panics.
pub fn shutdown() -> Result<(), SchedulerError> {
    let tracing_span = tracing::span!(Level::DEBUG, "global::shutdown");
    let _span_enter = tracing_span.enter();

    let worker = DEFAULT_WORKER.lock().unwrap_or_else(|e| e.into_inner()).take();
    let stopped = match worker {
        Some(w) => w.shutdown(),
        None => Ok(()),
    };

    let p = DEFAULT_QUEUE.swap(ptr::null_mut(), Ordering::AcqRel);
    if !p.is_null() {
        // safety: the reference published in default_run_queue
        drop(unsafe { Arc::from_raw(p) });
    }

    let mut p = REGISTRY.swap(ptr::null_mut(), Ordering::Acquire);
    let mut n = 0;
    while !p.is_null() {
        // safety: the reference taken in register
        let q = unsafe { Arc::from_raw(p) };
        p = q.registry_next.load(Ordering::Relaxed);
        assert!(q.is_idle(), "run queue {:?} still busy at shutdown", UsizePtr::from(&*q));
        n += 1;
    }
    tracing::debug!(queues = n, "scheduler shut down");

    stopped
}
