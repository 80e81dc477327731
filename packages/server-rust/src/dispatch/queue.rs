//! Per-unit dispatch queues.
//!
//! A [`DispatchQueue`] is a cheap, cloneable handle to an ordered queue of
//! pending callbacks. Callbacks of one queue are delivered in FIFO order by
//! the worker pool and never run concurrently with each other. The owning
//! [`QueueRegistration`] keeps the queue registered with the pool and
//! unregisters it when dropped.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, error};

use super::pool::PoolShared;

/// A unit of work delivered on a worker thread.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Unique identifier of a queue within its pool.
pub type QueueId = u64;

/// Upper bound on callbacks delivered from one queue before the worker
/// yields it back to the ready list.
pub(crate) const MAX_BATCH: usize = 64;

/// Priority class of a dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// Ordinary unit work.
    Ordinary,
    /// High-priority (meta) work, serviced before ordinary queues.
    Priority,
}

impl fmt::Display for QueueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ordinary => f.write_str("ordinary"),
            Self::Priority => f.write_str("priority"),
        }
    }
}

/// Errors returned when work cannot be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue is disabled")]
    Disabled,
    #[error("worker pool is stopped")]
    PoolStopped,
    #[error("worker pool has been released")]
    PoolReleased,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Callback>,
    /// Set while the queue sits in the pool's ready list or is being drained.
    scheduled: bool,
}

pub(crate) struct QueueShared {
    id: QueueId,
    class: QueueClass,
    owner: String,
    enabled: AtomicBool,
    state: Mutex<QueueState>,
    /// Held by a worker for the whole time it delivers callbacks of this queue.
    exec: Mutex<()>,
    /// Thread currently delivering callbacks, if any.
    runner: Mutex<Option<ThreadId>>,
    pool: Weak<PoolShared>,
}

impl QueueShared {
    pub(crate) fn new(id: QueueId, class: QueueClass, owner: &str, pool: Weak<PoolShared>) -> Self {
        Self {
            id,
            class,
            owner: owner.to_string(),
            enabled: AtomicBool::new(true),
            state: Mutex::new(QueueState::default()),
            exec: Mutex::new(()),
            runner: Mutex::new(None),
            pool,
        }
    }

    pub(crate) fn class(&self) -> QueueClass {
        self.class
    }

    /// Pushes a callback and reports whether the queue must be added to the
    /// ready list. Called with the pool state locked.
    pub(crate) fn push(&self, callback: Callback) -> bool {
        let mut state = self.state.lock();
        state.pending.push_back(callback);
        !std::mem::replace(&mut state.scheduled, true)
    }

    /// Delivers up to [`MAX_BATCH`] callbacks. Returns `true` if callbacks
    /// remain and the queue must be rescheduled.
    pub(crate) fn drain_batch(&self) -> bool {
        let _exec = self.exec.lock();
        *self.runner.lock() = Some(thread::current().id());

        let mut delivered = 0;
        let more = loop {
            // Checked under `exec` so `close` + `quiesce` observe a consistent cut.
            if !self.enabled.load(Ordering::Acquire) {
                let mut state = self.state.lock();
                state.pending.clear();
                state.scheduled = false;
                break false;
            }
            if delivered == MAX_BATCH {
                break true;
            }
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(callback) => callback,
                    None => {
                        state.scheduled = false;
                        break false;
                    }
                }
            };
            if catch_unwind(AssertUnwindSafe(next)).is_err() {
                error!(
                    "callback on {} queue of unit '{}' panicked",
                    self.class, self.owner
                );
            }
            delivered += 1;
        };

        *self.runner.lock() = None;
        more
    }
}

/// Handle to a unit's dispatch queue.
///
/// Handles are cloned freely into unit state and callbacks. Once the queue
/// is disabled every [`enqueue`](DispatchQueue::enqueue) fails with
/// [`DispatchError::Disabled`].
#[derive(Clone)]
pub struct DispatchQueue {
    shared: Arc<QueueShared>,
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("id", &self.shared.id)
            .field("class", &self.shared.class)
            .field("owner", &self.shared.owner)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl DispatchQueue {
    pub(crate) fn from_shared(shared: Arc<QueueShared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    #[must_use]
    pub fn class(&self) -> QueueClass {
        self.shared.class
    }

    /// Name of the unit this queue belongs to.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.shared.owner
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Number of callbacks waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Appends a callback to the queue and signals the pool.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Disabled`] once the queue has been disabled,
    /// [`DispatchError::PoolStopped`] once the pool stopped accepting work,
    /// and [`DispatchError::PoolReleased`] if the pool no longer exists.
    pub fn enqueue<F>(&self, callback: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.is_enabled() {
            return Err(DispatchError::Disabled);
        }
        let pool = self.shared.pool.upgrade().ok_or(DispatchError::PoolReleased)?;
        pool.schedule(&self.shared, Box::new(callback))
    }

    /// Stops delivery without waiting: pending callbacks are discarded and
    /// no further callback of this queue starts.
    pub(crate) fn close(&self) {
        if self.shared.enabled.swap(false, Ordering::AcqRel) {
            let dropped = {
                let mut state = self.shared.state.lock();
                std::mem::take(&mut state.pending)
            };
            if !dropped.is_empty() {
                debug!(
                    "discarded {} pending callback(s) on {} queue of unit '{}'",
                    dropped.len(),
                    self.shared.class,
                    self.shared.owner
                );
            }
        }
    }

    /// Waits until no callback of this queue is executing.
    ///
    /// Returns immediately when called from inside one of this queue's own
    /// callbacks.
    pub(crate) fn quiesce(&self) {
        if *self.shared.runner.lock() == Some(thread::current().id()) {
            return;
        }
        drop(self.shared.exec.lock());
    }

    /// Disables the queue. After this returns no callback of the queue will
    /// start, and any callback that was running on another thread has
    /// finished.
    pub fn disable(&self) {
        self.close();
        self.quiesce();
    }
}

/// Owning registration of a queue with its worker pool.
///
/// Dropping the registration disables the queue and removes it from the
/// pool, if the pool still exists.
pub struct QueueRegistration {
    queue: DispatchQueue,
}

impl QueueRegistration {
    pub(crate) fn new(queue: DispatchQueue) -> Self {
        Self { queue }
    }

    /// Returns a handle to the registered queue.
    #[must_use]
    pub fn handle(&self) -> DispatchQueue {
        self.queue.clone()
    }

    #[must_use]
    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl fmt::Debug for QueueRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueueRegistration").field(&self.queue).finish()
    }
}

impl Drop for QueueRegistration {
    fn drop(&mut self) {
        self.queue.disable();
        if let Some(pool) = self.queue.shared.pool.upgrade() {
            pool.unregister(self.queue.shared.id);
        }
    }
}
