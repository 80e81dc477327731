//! Liveness channels: heartbeat links whose loss triggers a callback.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::LivenessHandle;

/// Callback invoked once when a channel's peer is lost.
pub type BrokenCallback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ChannelShared {
    pub(crate) serial: u64,
    pub(crate) topic: String,
    pub(crate) id: String,
    started: AtomicBool,
    broken: AtomicBool,
    callback: Mutex<Option<BrokenCallback>>,
}

impl ChannelShared {
    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Marks the channel broken and runs its callback. Runs on the liveness
    /// executor; a channel that was never started or is already broken is
    /// left alone.
    pub(crate) fn fire(&self) {
        if !self.is_started() || self.broken.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("liveness channel {}:{} broken", self.topic, self.id);
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)).is_err() {
                warn!(
                    "broken callback of liveness channel {}:{} panicked",
                    self.topic, self.id
                );
            }
        }
    }
}

/// A heartbeat link to a remote peer, identified by a topic and an id.
///
/// The broken callback registered with [`on_broken`](LivenessChannel::on_broken)
/// fires at most once, on the liveness executor thread, and only after
/// [`start`](LivenessChannel::start). A break is declared either by a missed
/// heartbeat deadline or by [`LivenessHandle::signal_broken`]. Dropping the
/// channel stops monitoring.
pub struct LivenessChannel {
    shared: Arc<ChannelShared>,
    handle: LivenessHandle,
}

impl fmt::Debug for LivenessChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessChannel")
            .field("topic", &self.shared.topic)
            .field("id", &self.shared.id)
            .field("started", &self.is_started())
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl LivenessChannel {
    /// Creates an unstarted channel on `topic` for the peer `id`.
    #[must_use]
    pub fn new(handle: &LivenessHandle, topic: &str, id: &str) -> Self {
        let shared = Arc::new(ChannelShared {
            serial: handle.shared.next_serial(),
            topic: topic.to_string(),
            id: id.to_string(),
            started: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            callback: Mutex::new(None),
        });
        Self {
            shared,
            handle: handle.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Namespace-qualified identity, `<topic>:<id>`.
    #[must_use]
    pub fn qualified_id(&self) -> String {
        format!("{}:{}", self.shared.topic, self.shared.id)
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.shared.is_started()
    }

    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.shared.is_broken()
    }

    /// Registers the callback run when the peer is lost, replacing any
    /// previous one.
    pub fn on_broken<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.shared.callback.lock() = Some(Box::new(callback));
    }

    /// Starts monitoring the peer. Calling it again is a no-op.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handle.shared.watch(&self.shared);
        debug!("liveness channel {} started", self.qualified_id());
    }
}

impl Drop for LivenessChannel {
    fn drop(&mut self) {
        self.shared.callback.lock().take();
        self.handle.shared.unwatch(&self.shared);
    }
}
