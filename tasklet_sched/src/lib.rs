//! Cooperative tasklet scheduling on top of a transferable single word lock
//!
//! - [AtomicLock]: mutex with a one-CAS fast path, parked waiters, and an
//!   atomic ownership [transfer](AtomicLock::transfer) that another thread
//!   can [veto](AtomicLock::veto_pending_transfer)
//! - [Tasklet]: a handler that runs with its owning lock held, handed to it
//!   by a [RunQueue] without ever dropping to an unlocked state
//! - [WaitList]: counting semaphore whose waiters are tasklets
//! - [ThreadPool]: plain fixed size thread pool for blocking work
//!
//! Process wide state (the default run queue and its [Worker]) is created on
//! first use and released by [shutdown].

pub mod atomic_lock;
pub mod error;
mod loom_testing;
pub mod owned_lock;
pub mod run_queue;
pub mod tasklet;
pub mod thread_pool;
mod util;
pub mod wait_list;

pub use atomic_lock::{AtomicLock, Condition, LockWord, TransferOutcome};
pub use error::{SchedulerError, ThreadPoolError};
pub use owned_lock::OwnedLock;
pub use run_queue::global::{default_run_queue, set_preferred, shutdown};
pub use run_queue::{RunQueue, Worker};
pub use tasklet::{Handler, Tasklet};
pub use thread_pool::ThreadPool;
pub use wait_list::WaitList;
