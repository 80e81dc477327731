//! Host configuration types.

use std::time::Duration;

use unithost_core::names::{self, NameError};

/// Top-level configuration of a unit host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Namespace names and liveness topics are resolved under.
    pub namespace: String,
    /// Number of dispatch worker threads. 0 means one per available core.
    pub num_worker_threads: usize,
    /// Liveness channel settings.
    pub liveness: LivenessConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            namespace: "/".to_string(),
            num_worker_threads: 0,
            liveness: LivenessConfig::default(),
        }
    }
}

impl HostConfig {
    /// Returns the namespace in absolute, normalized form.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace is not a valid graph name.
    pub fn resolved_namespace(&self) -> Result<String, NameError> {
        names::normalize_namespace(&self.namespace)
    }
}

/// Liveness channel settings.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Silence after the last heartbeat that declares the peer lost.
    pub heartbeat_timeout: Duration,
    /// How often the liveness executor checks heartbeat deadlines.
    pub tick_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(4),
            tick_interval: Duration::from_millis(100),
        }
    }
}
