//! Dedicated single-thread executor for background tasks.
//!
//! Provides a generic `DedicatedWorker<T>` that owns one OS thread running a
//! current-thread tokio runtime. The runtime processes tasks from an mpsc
//! channel via a `BackgroundRunnable` implementation, with periodic tick
//! callbacks. Work on this thread is never starved by the dispatch pool.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Trait for task handlers executed by `DedicatedWorker`.
///
/// Implementors define how individual tasks are processed, what happens on
/// each periodic tick, and how to clean up on shutdown. All methods run on
/// the worker's thread.
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    fn shutdown(&mut self) {}
}

/// Background worker bound to its own thread.
///
/// The thread:
/// 1. Listens for tasks on the mpsc channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
pub struct DedicatedWorker<T: Send + 'static> {
    tx: Option<mpsc::UnboundedSender<T>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> DedicatedWorker<T> {
    /// Spawns the worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be built or the thread cannot
    /// be spawned.
    pub fn spawn<R>(name: &str, mut runnable: R, tick: Duration) -> std::io::Result<Self>
    where
        R: BackgroundRunnable<Task = T>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let thread_name = name.to_string();

        let thread = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            runtime.block_on(async move {
                let mut tick_interval = tokio::time::interval(tick);
                tick_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // Skip the first immediate tick so on_tick doesn't fire at startup.
                tick_interval.tick().await;

                loop {
                    tokio::select! {
                        task = rx.recv() => {
                            match task {
                                Some(t) => runnable.run(t),
                                None => break, // Channel closed.
                            }
                        }
                        _ = tick_interval.tick() => {
                            runnable.on_tick();
                        }
                        _ = &mut shutdown_rx => {
                            break;
                        }
                    }
                }

                runnable.shutdown();
            });
            debug!("{thread_name} exited");
        })?;

        Ok(Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Returns a sender for submitting tasks from any thread, or `None` once
    /// the worker has been stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::UnboundedSender<T>> {
        self.tx.clone()
    }

    /// Stops the worker and waits for its thread to exit.
    ///
    /// Tasks still queued are dropped unprocessed. When called from the
    /// worker's own thread the join is skipped.
    pub fn stop(&mut self) {
        // Signal shutdown.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Close the task channel.
        self.tx.take();
        // Wait for the worker thread to finish.
        if let Some(handle) = self.thread.take() {
            if handle.thread().id() == thread::current().id() {
                warn!("dedicated worker stopped from its own thread; not joining it");
                return;
            }
            if handle.join().is_err() {
                warn!("dedicated worker thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Drop for DedicatedWorker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
