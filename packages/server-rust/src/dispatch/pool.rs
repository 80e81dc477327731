//! Worker pool servicing dispatch queues.
//!
//! A fixed set of OS threads pulls ready queues from two ready lists
//! (priority first, then ordinary) and delivers their callbacks. A queue is
//! in at most one ready list at a time, so its callbacks never run on two
//! workers concurrently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::queue::{
    Callback, DispatchError, DispatchQueue, QueueClass, QueueId, QueueRegistration, QueueShared,
};

struct PoolState {
    accepting: bool,
    priority: VecDeque<Arc<QueueShared>>,
    ordinary: VecDeque<Arc<QueueShared>>,
}

impl PoolState {
    fn ready_list(&mut self, class: QueueClass) -> &mut VecDeque<Arc<QueueShared>> {
        match class {
            QueueClass::Priority => &mut self.priority,
            QueueClass::Ordinary => &mut self.ordinary,
        }
    }

    fn next_ready(&mut self) -> Option<Arc<QueueShared>> {
        self.priority.pop_front().or_else(|| self.ordinary.pop_front())
    }
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    ready: Condvar,
    queues: DashMap<QueueId, Weak<QueueShared>>,
    next_queue_id: AtomicU64,
}

impl PoolShared {
    /// Enqueues `callback` on `queue` and marks the queue ready if needed.
    pub(crate) fn schedule(
        &self,
        queue: &Arc<QueueShared>,
        callback: Callback,
    ) -> Result<(), DispatchError> {
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(DispatchError::PoolStopped);
        }
        if queue.push(callback) {
            state.ready_list(queue.class()).push_back(Arc::clone(queue));
            self.ready.notify_one();
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, id: QueueId) {
        if self.queues.remove(&id).is_some() {
            debug!("unregistered dispatch queue {id}");
        }
    }

    fn worker_loop(&self, index: usize) {
        loop {
            let queue = {
                let mut state = self.state.lock();
                loop {
                    if let Some(queue) = state.next_ready() {
                        break queue;
                    }
                    if !state.accepting {
                        debug!("worker {index} exiting");
                        return;
                    }
                    self.ready.wait(&mut state);
                }
            };

            if queue.drain_batch() {
                let mut state = self.state.lock();
                state.ready_list(queue.class()).push_back(queue);
                self.ready.notify_one();
            }
        }
    }
}

/// Shared pool of worker threads executing dispatch-queue callbacks.
///
/// Lifecycle:
/// 1. `new()` spawns the workers
/// 2. `register_queue()` hands out queues bound to this pool
/// 3. `stop()` stops accepting work, delivers everything already enqueued,
///    and joins the workers
/// 4. dropping the pool releases it; queues that outlive it report
///    [`DispatchError::PoolReleased`]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_worker_threads: usize,
}

impl WorkerPool {
    /// Spawns a pool with `num_worker_threads` workers. Zero selects the
    /// available hardware parallelism.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new(num_worker_threads: usize) -> std::io::Result<Self> {
        let num_worker_threads = if num_worker_threads == 0 {
            thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            num_worker_threads
        };

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                accepting: true,
                priority: VecDeque::new(),
                ordinary: VecDeque::new(),
            }),
            ready: Condvar::new(),
            queues: DashMap::new(),
            next_queue_id: AtomicU64::new(1),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(num_worker_threads)),
            num_worker_threads,
        };
        for index in 0..num_worker_threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("unithost-worker-{index}"))
                .spawn(move || shared.worker_loop(index))?;
            pool.workers.lock().push(handle);
        }

        info!("worker pool started with {num_worker_threads} worker thread(s)");
        Ok(pool)
    }

    #[must_use]
    pub fn num_worker_threads(&self) -> usize {
        self.num_worker_threads
    }

    /// Returns `true` until [`stop`](WorkerPool::stop) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().accepting
    }

    /// Number of queues currently registered.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Creates a queue of the given class for the unit named `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::PoolStopped`] once the pool has been stopped.
    pub fn register_queue(
        &self,
        owner: &str,
        class: QueueClass,
    ) -> Result<QueueRegistration, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::PoolStopped);
        }
        let id = self.shared.next_queue_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(QueueShared::new(
            id,
            class,
            owner,
            Arc::downgrade(&self.shared),
        ));
        self.shared.queues.insert(id, Arc::downgrade(&shared));
        debug!("registered {class} dispatch queue {id} for unit '{owner}'");
        Ok(QueueRegistration::new(DispatchQueue::from_shared(shared)))
    }

    /// Stops the pool.
    ///
    /// New work is rejected from this point on. Blocks until every callback
    /// already enqueued has been delivered and all workers have exited.
    /// Calling it again is a no-op.
    pub fn stop(&self) {
        {
            let mut state = self.shared.state.lock();
            state.accepting = false;
        }
        self.shared.ready.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                warn!("worker pool stopped from one of its own workers; not joining it");
                continue;
            }
            if handle.join().is_err() {
                warn!("worker thread panicked during shutdown");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::{Duration, Instant};

    use super::*;

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn zero_threads_selects_available_parallelism() {
        let pool = WorkerPool::new(0).unwrap();
        assert!(pool.num_worker_threads() >= 1);
    }

    #[test]
    fn delivers_enqueued_callbacks() {
        let pool = WorkerPool::new(2).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            reg.queue()
                .enqueue(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) == 10));
    }

    #[test]
    fn callbacks_of_one_queue_run_in_order() {
        let pool = WorkerPool::new(4).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..200 {
            let seen = Arc::clone(&seen);
            reg.queue().enqueue(move || seen.lock().push(i)).unwrap();
        }
        pool.stop();
        let seen = seen.lock().clone();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn callbacks_of_one_queue_never_overlap() {
        let pool = WorkerPool::new(4).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Priority).unwrap();
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        for _ in 0..100 {
            let busy = Arc::clone(&busy);
            let overlapped = Arc::clone(&overlapped);
            reg.queue()
                .enqueue(move || {
                    if busy.swap(true, Ordering::SeqCst) {
                        overlapped.store(true, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(50));
                    busy.store(false, Ordering::SeqCst);
                })
                .unwrap();
        }
        pool.stop();
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_drains_pending_callbacks() {
        let pool = WorkerPool::new(1).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let count = Arc::new(AtomicU32::new(0));
        for _ in 0..500 {
            let count = Arc::clone(&count);
            reg.queue()
                .enqueue(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        pool.stop();
        assert_eq!(count.load(Ordering::SeqCst), 500);
        assert!(!pool.is_running());
    }

    #[test]
    fn enqueue_after_stop_is_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        pool.stop();
        assert_eq!(reg.queue().enqueue(|| {}), Err(DispatchError::PoolStopped));
        assert!(matches!(
            pool.register_queue("late", QueueClass::Ordinary),
            Err(DispatchError::PoolStopped)
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let pool = WorkerPool::new(2).unwrap();
        pool.stop();
        pool.stop();
        assert!(!pool.is_running());
    }

    #[test]
    fn dropping_registration_unregisters_queue() {
        let pool = WorkerPool::new(1).unwrap();
        let a = pool.register_queue("a", QueueClass::Ordinary).unwrap();
        let b = pool.register_queue("a", QueueClass::Priority).unwrap();
        assert_eq!(pool.queue_count(), 2);
        let handle = a.handle();
        drop(a);
        assert_eq!(pool.queue_count(), 1);
        assert_eq!(handle.enqueue(|| {}), Err(DispatchError::Disabled));
        drop(b);
        assert_eq!(pool.queue_count(), 0);
    }

    #[test]
    fn queue_outliving_pool_reports_released() {
        let pool = WorkerPool::new(1).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let handle = reg.handle();
        drop(pool);
        assert_eq!(handle.enqueue(|| {}), Err(DispatchError::PoolReleased));
        // Unregistering against a released pool is a no-op.
        drop(reg);
    }

    #[test]
    fn disable_discards_pending_and_waits_for_in_flight() {
        let pool = WorkerPool::new(1).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicU32::new(0));

        {
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            reg.queue()
                .enqueue(move || {
                    started.store(true, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    finished.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }
        for _ in 0..5 {
            let late = Arc::clone(&late);
            reg.queue()
                .enqueue(move || {
                    late.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst)));
        reg.queue().disable();
        assert!(finished.load(Ordering::SeqCst), "disable must wait for the running callback");
        assert_eq!(reg.queue().pending(), 0);

        pool.stop();
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disable_from_own_callback_does_not_deadlock() {
        let pool = WorkerPool::new(1).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let handle = reg.handle();
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = Arc::clone(&done);
            reg.queue()
                .enqueue(move || {
                    handle.disable();
                    done.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst)));
        assert!(!reg.queue().is_enabled());
    }

    #[test]
    fn priority_queues_run_first() {
        let pool = WorkerPool::new(1).unwrap();
        let ordinary = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let priority = pool.register_queue("unit", QueueClass::Priority).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(AtomicBool::new(false));

        // Park the single worker so both queues become ready before it returns.
        let blocker = pool.register_queue("blocker", QueueClass::Ordinary).unwrap();
        {
            let gate = Arc::clone(&gate);
            blocker
                .queue()
                .enqueue(move || {
                    while !gate.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
        }
        {
            let order = Arc::clone(&order);
            ordinary.queue().enqueue(move || order.lock().push("ordinary")).unwrap();
        }
        {
            let order = Arc::clone(&order);
            priority.queue().enqueue(move || order.lock().push("priority")).unwrap();
        }
        gate.store(true, Ordering::SeqCst);
        pool.stop();

        assert_eq!(*order.lock(), vec!["priority", "ordinary"]);
    }

    #[test]
    fn panicking_callback_keeps_worker_alive() {
        let pool = WorkerPool::new(1).unwrap();
        let reg = pool.register_queue("unit", QueueClass::Ordinary).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        reg.queue().enqueue(|| panic!("boom")).unwrap();
        {
            let ran = Arc::clone(&ran);
            reg.queue().enqueue(move || ran.store(true, Ordering::SeqCst)).unwrap();
        }
        pool.stop();
        assert!(ran.load(Ordering::SeqCst));
    }
}
