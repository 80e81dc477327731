//! Heartbeat deadlines of liveness channels.

use dashmap::DashMap;

/// Process-unique serial of a liveness channel.
pub type ChannelSerial = u64;

/// Decides, per channel, whether its peer is still alive.
///
/// Timestamps are milliseconds on a monotonic clock chosen by the caller.
pub trait FailureDetector: Send + Sync {
    /// Records a heartbeat that reached `channel`.
    fn heartbeat(&self, channel: ChannelSerial, timestamp_ms: u64);

    /// Returns `true` if the peer of `channel` counts as alive at `timestamp_ms`.
    fn is_alive(&self, channel: ChannelSerial, timestamp_ms: u64) -> bool;

    /// Forgets `channel`.
    fn remove(&self, channel: ChannelSerial);
}

/// Declares a peer lost once a heartbeat was seen and then none followed
/// within the timeout. A channel without any heartbeat stays alive.
pub struct DeadlineFailureDetector {
    timeout_ms: u64,
    last_seen: DashMap<ChannelSerial, u64>,
}

impl DeadlineFailureDetector {
    #[must_use]
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            last_seen: DashMap::new(),
        }
    }
}

impl FailureDetector for DeadlineFailureDetector {
    fn heartbeat(&self, channel: ChannelSerial, timestamp_ms: u64) {
        self.last_seen
            .entry(channel)
            .and_modify(|last| *last = (*last).max(timestamp_ms))
            .or_insert(timestamp_ms);
    }

    fn is_alive(&self, channel: ChannelSerial, timestamp_ms: u64) -> bool {
        self.last_seen
            .get(&channel)
            .is_none_or(|last| timestamp_ms.saturating_sub(*last) <= self.timeout_ms)
    }

    fn remove(&self, channel: ChannelSerial) {
        self.last_seen.remove(&channel);
    }
}
