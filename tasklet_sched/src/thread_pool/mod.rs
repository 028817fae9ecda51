//! Fixed size pool of OS threads fed from a shared FIFO
//!
//! Independent of the tasklet machinery, for work that really does want to
//! block a thread.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::error::ThreadPoolError;

const POOL_THREAD_NAME_PREFIX: &str = "tasklet-pool";

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Shutdown {
    /// Finish the task in hand, drop the rest of the queue
    Immediate,
    /// Drain the queue first
    Graceful,
}

struct PoolState {
    tasks: VecDeque<Task>,
    shutdown: Option<Shutdown>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl PoolShared {
    fn lock(&self) -> Result<MutexGuard<'_, PoolState>, ThreadPoolError> {
        self.state.lock().map_err(|_| {
            tracing::error!("thread pool lock poisoned");
            ThreadPoolError::LockFail
        })
    }
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool").finish_non_exhaustive()
    }
}

fn pool_thread(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let Ok(mut st) = shared.state.lock() else {
                tracing::error!("thread pool lock poisoned, thread exiting");
                return;
            };
            loop {
                match st.shutdown {
                    Some(Shutdown::Immediate) => break None,
                    Some(Shutdown::Graceful) if st.tasks.is_empty() => break None,
                    _ => {}
                }
                if let Some(task) = st.tasks.pop_front() {
                    break Some(task);
                }
                st = match shared.cond.wait(st) {
                    Ok(guard) => guard,
                    Err(_) => {
                        tracing::error!("thread pool lock poisoned, thread exiting");
                        return;
                    }
                };
            }
        };
        match task {
            Some(task) => task(),
            None => return,
        }
    }
}

impl ThreadPool {
    /// Start `threads` pool threads
    pub fn new(threads: usize) -> Result<Self, ThreadPoolError> {
        if threads == 0 {
            tracing::error!("thread pool needs at least one thread");
            return Err(ThreadPoolError::Invalid);
        }

        let pool = Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    tasks: VecDeque::new(),
                    shutdown: None,
                }),
                cond: Condvar::new(),
            }),
            threads: Mutex::new(Vec::with_capacity(threads)),
        };

        for i in 0..threads {
            let shared = pool.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", POOL_THREAD_NAME_PREFIX, i))
                .spawn(move || pool_thread(shared));
            match spawned {
                Ok(handle) => {
                    tracing::info!(thread = i, "pool thread started");
                    pool.threads
                        .lock()
                        .map_err(|_| ThreadPoolError::LockFail)?
                        .push(handle);
                }
                Err(e) => {
                    tracing::error!(thread = i, error = %e, "failed to start pool thread");
                    // the threads already running are stopped by drop
                    return Err(ThreadPoolError::ThreadFail);
                }
            }
        }

        Ok(pool)
    }

    /// Queue `f` to run on some pool thread
    pub fn submit<F>(&self, f: F) -> Result<(), ThreadPoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.lock()?;
        if st.shutdown.is_some() {
            return Err(ThreadPoolError::AlreadyShutDown);
        }
        st.tasks.push_back(Box::new(f));
        drop(st);
        self.shared.cond.notify_one();
        Ok(())
    }

    /// Stop the pool and join its threads
    ///
    /// With `graceful` every queued task runs first, otherwise threads stop
    /// after the task they are running and the queue is dropped.
    pub fn destroy(&self, graceful: bool) -> Result<(), ThreadPoolError> {
        {
            let mut st = self.shared.lock()?;
            if st.shutdown.is_some() {
                return Err(ThreadPoolError::AlreadyShutDown);
            }
            st.shutdown = Some(if graceful {
                Shutdown::Graceful
            } else {
                Shutdown::Immediate
            });
        }
        self.shared.cond.notify_all();

        let threads = std::mem::take(
            &mut *self
                .threads
                .lock()
                .map_err(|_| ThreadPoolError::LockFail)?,
        );
        let mut ret = Ok(());
        for (i, handle) in threads.into_iter().enumerate() {
            if handle.join().is_err() {
                tracing::error!(thread = i, "pool thread panicked");
                ret = Err(ThreadPoolError::ThreadFail);
            }
            tracing::info!(thread = i, "pool thread exit");
        }

        // whatever an immediate shutdown left behind
        let dropped = std::mem::take(&mut self.shared.lock()?.tasks);
        if !dropped.is_empty() {
            tracing::info!(dropped = dropped.len(), "discarding queued tasks");
        }
        ret
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        match self.destroy(false) {
            Ok(()) | Err(ThreadPoolError::AlreadyShutDown) => {}
            Err(e) => tracing::error!(error = %e, "thread pool shutdown failed"),
        }
    }
}

#[cfg(test)]
mod tests;
