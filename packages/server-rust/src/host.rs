//! The unit host: owns the worker pool, the liveness executor, the registry
//! and its front-end, and tears them down in a fixed order.

use std::sync::{Arc, Weak};

use anyhow::Context as _;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::HostConfig;
use crate::dispatch::WorkerPool;
use crate::liveness::LivenessExecutor;
use crate::registry::UnitRegistry;
use crate::service::LoaderService;
use crate::teardown::{TeardownPhase, TeardownState};
use crate::unit::UnitFactory;

/// Components released during teardown.
struct HostParts {
    service: Option<Arc<LoaderService>>,
    liveness: Option<LivenessExecutor>,
    pool: Option<Arc<WorkerPool>>,
}

/// A running unit host.
///
/// Lifecycle:
/// 1. `new()` starts the worker pool and the liveness executor and creates
///    an empty registry
/// 2. callers reach the registry through [`service`](UnitHost::service)
/// 3. `shutdown()` (or dropping the host) runs the teardown sequence:
///    front-end and liveness executor go first, then the worker pool stops
///    and drains, then every unit is destroyed, then the pool is released
pub struct UnitHost {
    phase: TeardownState,
    registry: Arc<UnitRegistry>,
    pool: Weak<WorkerPool>,
    parts: Mutex<HostParts>,
}

impl UnitHost {
    /// Starts a host.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace is invalid or a thread cannot be
    /// spawned.
    pub fn new(config: &HostConfig, factory: Arc<dyn UnitFactory>) -> anyhow::Result<Self> {
        let namespace = config
            .resolved_namespace()
            .with_context(|| format!("invalid host namespace {:?}", config.namespace))?;
        let pool = Arc::new(
            WorkerPool::new(config.num_worker_threads).context("failed to start worker pool")?,
        );
        let liveness =
            LivenessExecutor::spawn(&config.liveness).context("failed to start liveness executor")?;
        let handle = liveness.handle();
        let registry = UnitRegistry::new(factory, &pool, Some(handle.clone()), &namespace)?;
        let service = Arc::new(LoaderService::new(Arc::clone(&registry), Some(handle)));

        info!(
            "unit host running in namespace {namespace} with {} worker thread(s)",
            pool.num_worker_threads()
        );
        Ok(Self {
            phase: TeardownState::new(),
            registry,
            pool: Arc::downgrade(&pool),
            parts: Mutex::new(HostParts {
                service: Some(service),
                liveness: Some(liveness),
                pool: Some(pool),
            }),
        })
    }

    #[must_use]
    pub fn phase(&self) -> TeardownPhase {
        self.phase.phase()
    }

    #[must_use]
    pub fn phase_handle(&self) -> TeardownState {
        self.phase.clone()
    }

    /// The front-end, until teardown begins.
    #[must_use]
    pub fn service(&self) -> Option<Arc<LoaderService>> {
        self.parts.lock().service.clone()
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// Weak handle to the worker pool; it no longer upgrades once the host
    /// reached [`TeardownPhase::Released`].
    #[must_use]
    pub fn worker_pool(&self) -> Weak<WorkerPool> {
        Weak::clone(&self.pool)
    }

    /// Runs the teardown sequence. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let mut parts = self.parts.lock();
        if !self.phase.advance(TeardownPhase::StoppingWorkers) {
            return;
        }
        info!("unit host shutting down");

        parts.service.take();
        if let Some(mut liveness) = parts.liveness.take() {
            liveness.stop();
        }
        if let Some(pool) = parts.pool.as_ref() {
            pool.stop();
        }

        let cleared = self.registry.clear();
        debug!("destroyed {cleared} unit(s) during shutdown");
        self.phase.advance(TeardownPhase::UnitsCleared);

        parts.pool.take();
        self.phase.advance(TeardownPhase::Released);
        info!("unit host released");
    }
}

impl Drop for UnitHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}
