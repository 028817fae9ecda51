//! Errors returned by the fallible parts of the scheduler
//!
//! Contract violations (wrong lock held, a handler that neither stops nor
//! waits, ...) are not represented here, they panic at the point of misuse.

use std::error::Error;
use std::fmt::Display;
use std::io;

/// Failure to bring up or tear down scheduler threads
#[derive(Debug)]
pub enum SchedulerError {
    /// The OS refused to start a worker thread
    WorkerSpawn(io::Error),
    /// A worker thread panicked while draining its run queue
    WorkerPanicked,
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::WorkerSpawn(e) => write!(f, "failed to spawn worker thread: {}", e),
            SchedulerError::WorkerPanicked => write!(f, "worker thread panicked"),
        }
    }
}

impl Error for SchedulerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SchedulerError::WorkerSpawn(e) => Some(e),
            SchedulerError::WorkerPanicked => None,
        }
    }
}

impl From<io::Error> for SchedulerError {
    fn from(value: io::Error) -> Self {
        Self::WorkerSpawn(value)
    }
}

/// Errors reported by [crate::thread_pool::ThreadPool]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPoolError {
    /// Bad argument, e.g. a pool with zero threads
    Invalid,
    /// The pool's internal lock was poisoned
    LockFail,
    /// The pool was already shut down
    AlreadyShutDown,
    /// A pool thread could not be started or joined
    ThreadFail,
}

impl ThreadPoolError {
    /// Numeric code for callers that report errors as integers
    pub const fn code(self) -> i32 {
        match self {
            ThreadPoolError::Invalid => -1,
            ThreadPoolError::LockFail => -2,
            ThreadPoolError::AlreadyShutDown => -3,
            ThreadPoolError::ThreadFail => -5,
        }
    }
}

impl Display for ThreadPoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreadPoolError::Invalid => write!(f, "invalid thread pool argument"),
            ThreadPoolError::LockFail => write!(f, "thread pool lock failed"),
            ThreadPoolError::AlreadyShutDown => write!(f, "thread pool already shut down"),
            ThreadPoolError::ThreadFail => write!(f, "thread pool thread failed"),
        }
    }
}

impl Error for ThreadPoolError {}
