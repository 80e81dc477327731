//! Callback dispatch: per-unit queues serviced by a shared worker pool.
//!
//! Each loaded unit owns two queues, one per [`QueueClass`]. Queues are
//! registered with the [`WorkerPool`] at load time and unregistered when the
//! unit is destroyed.

pub mod pool;
pub mod queue;

pub use pool::WorkerPool;
pub use queue::{Callback, DispatchError, DispatchQueue, QueueClass, QueueId, QueueRegistration};
