use std::fmt::Debug;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::{global, RunQueue};
use crate::error::SchedulerError;
use crate::loom_testing::*;
use crate::owned_lock::OwnedLock;
use crate::tasklet::Tasklet;
use crate::util::UsizePtr;

const WORKER_THREAD_NAME: &str = "tasklet-worker";

/// Dedicated thread draining one run queue
///
/// Its own queue is the thread's preferred queue, so tasklets scheduled from
/// inside handlers it runs land on the same queue. Dropping a worker stops
/// it and joins the thread.
pub struct Worker {
    queue: Arc<RunQueue>,
    stopping: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &UsizePtr::from(&*self.queue))
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Worker {
    pub fn spawn(queue: Arc<RunQueue>) -> Result<Self, SchedulerError> {
        let stopping = Arc::new(AtomicBool::new(false));

        let thread_queue = queue.clone();
        let thread_stopping = stopping.clone();
        let thread = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_owned())
            .spawn(move || {
                tracing::debug!(runq_ptr = ?UsizePtr::from(&*thread_queue), "worker started");
                global::set_preferred(Some(thread_queue.clone()));
                while !thread_stopping.load(Ordering::Acquire) {
                    thread_queue.run(true);
                }
                global::set_preferred(None);
                tracing::debug!(runq_ptr = ?UsizePtr::from(&*thread_queue), "worker exiting");
            })
            .map_err(|e| {
                tracing::error!(error = %e, "failed to spawn worker thread");
                SchedulerError::WorkerSpawn(e)
            })?;

        Ok(Self {
            queue,
            stopping,
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    /// Stop the worker after everything already queued ahead of the stop
    /// request has run, and join its thread
    pub fn shutdown(mut self) -> Result<(), SchedulerError> {
        self.stop_thread()
    }

    fn stop_thread(&mut self) -> Result<(), SchedulerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        // the stop request is itself a tasklet, so it is ordered behind
        // whatever is queued and runs on the worker thread
        let lock = Arc::new(OwnedLock::new());
        let stopper = Tasklet::new(lock.clone());
        let stopping = self.stopping.clone();
        stopper.defer_on(&self.queue, move |t| {
            stopping.store(true, Ordering::Release);
            t.stop();
        });

        let joined = thread.join();

        // a worker that died early never got to the stop tasklet
        lock.lock();
        stopper.fini();
        lock.unlock();

        joined.map_err(|_| {
            tracing::error!(runq_ptr = ?UsizePtr::from(&*self.queue), "worker thread panicked");
            SchedulerError::WorkerPanicked
        })
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.stop_thread() {
            tracing::error!(error = %e, "worker shutdown failed");
        }
    }
}
