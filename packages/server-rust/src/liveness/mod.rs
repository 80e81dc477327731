//! Liveness channels and the executor that delivers their break events.
//!
//! All break callbacks run on one dedicated thread owned by the
//! [`LivenessExecutor`], separate from the dispatch worker pool and from
//! the threads calling into the registry. A slow unit workload therefore
//! cannot delay break detection, and a break callback that re-enters the
//! registry never runs while a registry caller holds its lock.

pub mod channel;
pub mod detector;
pub mod executor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::LivenessConfig;

pub use channel::{BrokenCallback, LivenessChannel};
pub use detector::{ChannelSerial, DeadlineFailureDetector, FailureDetector};
pub use executor::{BackgroundRunnable, DedicatedWorker};

use channel::ChannelShared;

/// Tasks processed on the liveness executor thread.
pub(crate) enum LivenessTask {
    /// The peer of this channel was declared lost explicitly.
    Broken(Weak<ChannelShared>),
}

pub(crate) struct LivenessShared {
    detector: Box<dyn FailureDetector>,
    channels: DashMap<u64, Weak<ChannelShared>>,
    epoch: Instant,
    next_serial: AtomicU64,
}

impl LivenessShared {
    fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            detector: Box::new(DeadlineFailureDetector::new(duration_ms(heartbeat_timeout))),
            channels: DashMap::new(),
            epoch: Instant::now(),
            next_serial: AtomicU64::new(1),
        }
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.epoch.elapsed())
    }

    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn watch(&self, channel: &Arc<ChannelShared>) {
        self.channels.insert(channel.serial, Arc::downgrade(channel));
    }

    pub(crate) fn unwatch(&self, channel: &ChannelShared) {
        if self.channels.remove(&channel.serial).is_some() {
            self.detector.remove(channel.serial);
        }
    }

    /// Started, unbroken channels carrying `id`.
    fn started_with_id(&self, id: &str) -> Vec<Arc<ChannelShared>> {
        self.channels
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .filter(|c| c.id == id && c.is_started() && !c.is_broken())
            .collect()
    }

    fn heartbeat(&self, id: &str) -> bool {
        let channels = self.started_with_id(id);
        let now = self.now_ms();
        for channel in &channels {
            self.detector.heartbeat(channel.serial, now);
        }
        !channels.is_empty()
    }

    /// Started, unbroken channels whose peer missed its deadline.
    fn expired(&self) -> Vec<Arc<ChannelShared>> {
        let now = self.now_ms();
        self.channels
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .filter(|c| c.is_started() && !c.is_broken() && !self.detector.is_alive(c.serial, now))
            .collect()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct LivenessMonitor {
    shared: Arc<LivenessShared>,
}

impl BackgroundRunnable for LivenessMonitor {
    type Task = LivenessTask;

    fn run(&mut self, task: LivenessTask) {
        match task {
            LivenessTask::Broken(channel) => {
                if let Some(channel) = channel.upgrade() {
                    channel.fire();
                }
            }
        }
    }

    fn on_tick(&mut self) {
        // Collected first: a callback may drop its channel, which touches the map.
        for channel in self.shared.expired() {
            channel.fire();
        }
    }

    fn shutdown(&mut self) {
        debug!("liveness monitor shutting down");
    }
}

/// Cloneable handle for creating channels and routing peer heartbeats.
#[derive(Clone)]
pub struct LivenessHandle {
    tx: mpsc::UnboundedSender<LivenessTask>,
    shared: Arc<LivenessShared>,
}

impl LivenessHandle {
    /// Creates an unstarted channel bound to this executor.
    #[must_use]
    pub fn channel(&self, topic: &str, id: &str) -> LivenessChannel {
        LivenessChannel::new(self, topic, id)
    }

    /// Records a heartbeat from the peer `id`. Returns `false` if no started
    /// channel carries that id.
    #[must_use]
    pub fn heartbeat(&self, id: &str) -> bool {
        self.shared.heartbeat(id)
    }

    /// Declares the peer `id` lost. Every started, unbroken channel carrying
    /// that id breaks on the executor thread. Returns `false` if there is no
    /// such channel or the executor has stopped.
    #[must_use]
    pub fn signal_broken(&self, id: &str) -> bool {
        let channels = self.shared.started_with_id(id);
        let mut sent = false;
        for channel in &channels {
            if self.tx.send(LivenessTask::Broken(Arc::downgrade(channel))).is_ok() {
                sent = true;
            } else {
                debug!("liveness executor stopped; dropping break of {}:{id}", channel.topic);
            }
        }
        sent
    }

    /// Returns `false` once the executor has stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Number of live (not yet dropped) channels that have been started.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.shared.channels.len()
    }
}

impl std::fmt::Debug for LivenessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessHandle")
            .field("running", &self.is_running())
            .field("watched", &self.watched())
            .finish()
    }
}

/// Owner of the liveness thread.
pub struct LivenessExecutor {
    worker: DedicatedWorker<LivenessTask>,
    handle: LivenessHandle,
}

impl LivenessExecutor {
    /// Spawns the executor thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread or its runtime cannot be created.
    pub fn spawn(config: &LivenessConfig) -> std::io::Result<Self> {
        let shared = Arc::new(LivenessShared::new(config.heartbeat_timeout));
        let monitor = LivenessMonitor {
            shared: Arc::clone(&shared),
        };
        let worker = DedicatedWorker::spawn("unithost-liveness", monitor, config.tick_interval)?;
        let tx = worker
            .sender()
            .ok_or_else(|| std::io::Error::other("liveness worker exited during startup"))?;
        Ok(Self {
            worker,
            handle: LivenessHandle { tx, shared },
        })
    }

    #[must_use]
    pub fn handle(&self) -> LivenessHandle {
        self.handle.clone()
    }

    /// Stops the executor thread. No break callback runs after this returns.
    pub fn stop(&mut self) {
        self.worker.stop();
    }
}
