//! Lifecycle registry: exclusive ownership of loaded units by name.
//!
//! Every operation holds one registry lock for its duration, so a `load` and
//! an `unload` of the same name are totally ordered and no two loads of one
//! name can both succeed. Destruction is split in two halves:
//!
//! 1. under the lock the entry leaves the map, the unit is disabled and both
//!    of its queues stop delivering;
//! 2. after the lock is released the registry waits for callbacks still
//!    executing on other threads and then drops the unit, its liveness
//!    channel and its queue registrations.
//!
//! A callback that re-enters the registry (for example to unload its own
//! unit) therefore never waits on itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use unithost_core::names::{self, NameError};
use unithost_core::RemapTable;

use crate::dispatch::{DispatchError, QueueClass, QueueRegistration, WorkerPool};
use crate::liveness::{LivenessChannel, LivenessHandle};
use crate::unit::{FactoryError, Unit, UnitContext, UnitFactory};

const UNITS_LOADED: &str = "unithost_units_loaded_total";
const UNITS_UNLOADED: &str = "unithost_units_unloaded_total";
const LOAD_FAILURES: &str = "unithost_load_failures_total";
const UNITS_ACTIVE: &str = "unithost_units_active";

/// Errors reported by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a unit named '{name}' is already loaded")]
    NameTaken { name: String },
    #[error("failed to create unit '{name}' of type '{type_name}'")]
    Factory {
        name: String,
        type_name: String,
        #[source]
        source: FactoryError,
    },
    #[error("unit '{name}' failed to initialize")]
    Init {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("unit '{name}' requested liveness id '{id}' but no liveness executor is running")]
    LivenessUnavailable { name: String, id: String },
    #[error("cannot allocate dispatch queues for unit '{name}'")]
    Dispatch {
        name: String,
        #[source]
        source: DispatchError,
    },
    #[error("no unit named '{name}' is loaded")]
    NotFound { name: String },
}

/// Parameters of one load.
#[derive(Debug, Clone, Default)]
pub struct LoadSpec {
    pub name: String,
    pub type_name: String,
    pub remappings: RemapTable,
    pub args: Vec<String>,
    /// Binds the unit to a liveness channel; its loss unloads the unit.
    pub liveness_id: Option<String>,
}

impl LoadSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_remappings(mut self, remappings: RemapTable) -> Self {
        self.remappings = remappings;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_liveness_id(mut self, id: impl Into<String>) -> Self {
        self.liveness_id = Some(id.into());
        self
    }
}

/// A unit owned by the registry together with everything wired to it.
///
/// Fields drop in declaration order: the unit goes before the queue
/// registrations, so the pool still knows the queues while the unit is
/// destroyed.
struct LoadedUnit {
    unit: Box<dyn Unit>,
    liveness: Option<LivenessChannel>,
    ordinary: QueueRegistration,
    priority: QueueRegistration,
    type_name: String,
    generation: u64,
    disabled: bool,
}

impl LoadedUnit {
    /// First half of destruction, run under the registry lock.
    fn begin_teardown(&mut self) {
        if !self.disabled {
            self.disabled = true;
            self.unit.disable();
        }
        self.ordinary.queue().close();
        self.priority.queue().close();
    }
}

impl Drop for LoadedUnit {
    fn drop(&mut self) {
        self.begin_teardown();
        self.ordinary.queue().quiesce();
        self.priority.queue().quiesce();
        self.liveness.take();
    }
}

#[derive(Default)]
struct RegistryState {
    units: BTreeMap<String, LoadedUnit>,
    next_generation: u64,
}

/// Owns the loaded units of one host.
pub struct UnitRegistry {
    state: Mutex<RegistryState>,
    factory: Arc<dyn UnitFactory>,
    pool: Weak<WorkerPool>,
    liveness: Option<LivenessHandle>,
    namespace: String,
    liveness_topic: String,
    this: Weak<UnitRegistry>,
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("namespace", &self.namespace)
            .field("units", &self.list_names())
            .finish_non_exhaustive()
    }
}

impl UnitRegistry {
    /// Creates an empty registry bound to `pool`.
    ///
    /// Only a weak handle to the pool is kept; loads fail once the pool has
    /// been released. Without a liveness handle, loads that request a
    /// liveness id are rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if `namespace` is not a valid graph name.
    pub fn new(
        factory: Arc<dyn UnitFactory>,
        pool: &Arc<WorkerPool>,
        liveness: Option<LivenessHandle>,
        namespace: &str,
    ) -> Result<Arc<Self>, NameError> {
        let namespace = names::normalize_namespace(namespace)?;
        let liveness_topic = names::qualify(&namespace, "bond")?;
        Ok(Arc::new_cyclic(|this| Self {
            state: Mutex::new(RegistryState::default()),
            factory,
            pool: Arc::downgrade(pool),
            liveness,
            namespace,
            liveness_topic,
            this: Weak::clone(this),
        }))
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Topic liveness channels of this registry are created on.
    #[must_use]
    pub fn liveness_topic(&self) -> &str {
        &self.liveness_topic
    }

    /// Loads a unit.
    ///
    /// The unit is listed before its `init` runs. `init` runs with the
    /// registry lock held; its liveness channel, if any, is started only
    /// once `init` has succeeded.
    ///
    /// # Errors
    ///
    /// Fails without leaving an entry behind when the name is taken, the
    /// factory fails, the pool cannot provide queues, a liveness id is given
    /// without a liveness executor, or `init` fails.
    pub fn load(&self, spec: LoadSpec) -> Result<(), RegistryError> {
        let result = self.try_load(spec);
        match &result {
            Ok(()) => metrics::counter!(UNITS_LOADED).increment(1),
            Err(e) => {
                metrics::counter!(LOAD_FAILURES).increment(1);
                error!("{}", error_chain(e));
            }
        }
        result
    }

    fn try_load(&self, spec: LoadSpec) -> Result<(), RegistryError> {
        let LoadSpec {
            name,
            type_name,
            remappings,
            args,
            liveness_id,
        } = spec;
        let liveness_id = liveness_id.filter(|id| !id.is_empty());

        let mut state = self.state.lock();
        if state.units.contains_key(&name) {
            return Err(RegistryError::NameTaken { name });
        }
        if let (Some(id), None) = (&liveness_id, &self.liveness) {
            return Err(RegistryError::LivenessUnavailable {
                id: id.clone(),
                name,
            });
        }

        let pool = self.pool.upgrade().ok_or_else(|| RegistryError::Dispatch {
            name: name.clone(),
            source: DispatchError::PoolReleased,
        })?;
        let unit = self
            .factory
            .create(&type_name)
            .map_err(|source| RegistryError::Factory {
                name: name.clone(),
                type_name: type_name.clone(),
                source,
            })?;
        let register = |class: QueueClass| {
            pool.register_queue(&name, class)
                .map_err(|source| RegistryError::Dispatch {
                    name: name.clone(),
                    source,
                })
        };
        let ordinary = register(QueueClass::Ordinary)?;
        let priority = register(QueueClass::Priority)?;
        drop(pool);

        let generation = state.next_generation;
        state.next_generation += 1;

        let ctx = UnitContext {
            name: name.clone(),
            type_name: type_name.clone(),
            namespace: self.namespace.clone(),
            remappings,
            args,
            liveness_id: liveness_id.clone(),
            ordinary: ordinary.handle(),
            priority: priority.handle(),
        };
        let init = state
            .units
            .entry(name.clone())
            .or_insert(LoadedUnit {
                unit,
                liveness: None,
                ordinary,
                priority,
                type_name: type_name.clone(),
                generation,
                disabled: false,
            })
            .unit
            .init(&ctx);
        drop(ctx);

        if let Err(source) = init {
            let mut failed = state.units.remove(&name);
            if let Some(entry) = failed.as_mut() {
                entry.begin_teardown();
            }
            drop(state);
            drop(failed);
            return Err(RegistryError::Init { name, source });
        }

        if let (Some(id), Some(handle)) = (liveness_id.as_deref(), self.liveness.as_ref()) {
            let channel = handle.channel(&self.liveness_topic, id);
            let registry = Weak::clone(&self.this);
            let unit_name = name.clone();
            channel.on_broken(move || unload_on_break(&registry, &unit_name, generation));
            if let Some(entry) = state.units.get_mut(&name) {
                let channel = entry.liveness.insert(channel);
                channel.start();
                debug!(
                    "unit '{name}' bound to liveness channel {}",
                    channel.qualified_id()
                );
            }
        }

        record_active(state.units.len());
        info!("Loaded unit '{name}' of type '{type_name}'");
        Ok(())
    }

    /// Unloads the unit named `name`.
    ///
    /// Returns once no callback of the unit is running, unless called from
    /// one of the unit's own callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no such unit is loaded.
    pub fn unload(&self, name: &str) -> Result<(), RegistryError> {
        self.remove(name, None)
    }

    fn remove(&self, name: &str, generation: Option<u64>) -> Result<(), RegistryError> {
        let removed = {
            let mut state = self.state.lock();
            let present = state
                .units
                .get(name)
                .is_some_and(|entry| generation.is_none_or(|g| entry.generation == g));
            let entry = if present {
                state.units.remove(name)
            } else {
                None
            };
            let Some(mut entry) = entry else {
                return Err(RegistryError::NotFound {
                    name: name.to_string(),
                });
            };
            entry.begin_teardown();
            record_active(state.units.len());
            entry
        };
        let type_name = removed.type_name.clone();
        drop(removed);

        metrics::counter!(UNITS_UNLOADED).increment(1);
        info!("Unloaded unit '{name}' of type '{type_name}'");
        Ok(())
    }

    /// Unloads every unit and returns how many were removed.
    ///
    /// Pending callbacks of the removed units are discarded. The worker pool
    /// keeps running; stop it first if every enqueued callback must be
    /// delivered before the units are destroyed.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut state = self.state.lock();
            let mut units = std::mem::take(&mut state.units);
            for entry in units.values_mut() {
                entry.begin_teardown();
            }
            record_active(0);
            units
        };
        let count = removed.len();
        drop(removed);

        if count > 0 {
            metrics::counter!(UNITS_UNLOADED).increment(count as u64);
            info!("Cleared {count} unit(s)");
        }
        count
    }

    /// Names of the loaded units, sorted.
    #[must_use]
    pub fn list_names(&self) -> Vec<String> {
        self.state.lock().units.keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().units.contains_key(name)
    }

    /// Type name of the unit loaded as `name`.
    #[must_use]
    pub fn type_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .units
            .get(name)
            .map(|entry| entry.type_name.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Break callback of a unit's liveness channel. Runs on the liveness
/// executor. A unit that was already unloaded, or replaced by a newer load
/// of the same name, is left alone.
fn unload_on_break(registry: &Weak<UnitRegistry>, name: &str, generation: u64) {
    let Some(registry) = registry.upgrade() else {
        debug!("liveness of unit '{name}' broke after its registry was released");
        return;
    };
    match registry.remove(name, Some(generation)) {
        Ok(()) => warn!("Unit '{name}' unloaded after its liveness channel broke"),
        Err(e) => debug!("ignoring liveness break: {e}"),
    }
}

/// Renders an error followed by its sources, separated by `: `.
#[must_use]
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[allow(clippy::cast_precision_loss)]
fn record_active(count: usize) {
    metrics::gauge!(UNITS_ACTIVE).set(count as f64);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::config::LivenessConfig;
    use crate::liveness::LivenessExecutor;
    use crate::unit::TypeRegistryFactory;

    const TRACKED: &str = "test/Tracked";
    const FAILS_INIT: &str = "test/FailsInit";

    /// Shared observations of every tracked unit a factory creates.
    #[derive(Default)]
    struct Tracker {
        created: AtomicU32,
        disabled: AtomicU32,
        dropped: AtomicU32,
    }

    struct TrackedUnit {
        tracker: Arc<Tracker>,
        fail_init: bool,
    }

    impl Unit for TrackedUnit {
        fn init(&mut self, _ctx: &UnitContext) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("sensor offline");
            }
            Ok(())
        }

        fn disable(&mut self) {
            self.tracker.disabled.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Drop for TrackedUnit {
        fn drop(&mut self) {
            self.tracker.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked_factory() -> (Arc<dyn UnitFactory>, Arc<Tracker>) {
        let tracker = Arc::new(Tracker::default());
        let factory = TypeRegistryFactory::new();
        for (type_name, fail_init) in [(TRACKED, false), (FAILS_INIT, true)] {
            let tracker = Arc::clone(&tracker);
            factory.register(type_name, move || {
                tracker.created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(TrackedUnit {
                    tracker: Arc::clone(&tracker),
                    fail_init,
                }))
            });
        }
        (Arc::new(factory), tracker)
    }

    fn setup() -> (Arc<UnitRegistry>, Arc<WorkerPool>, Arc<Tracker>) {
        let (factory, tracker) = tracked_factory();
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let registry = UnitRegistry::new(factory, &pool, None, "/").unwrap();
        (registry, pool, tracker)
    }

    fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn error_chain_includes_sources() {
        let err = RegistryError::Init {
            name: "cam".to_string(),
            source: anyhow::anyhow!("sensor offline"),
        };
        assert_eq!(
            error_chain(&err),
            "unit 'cam' failed to initialize: sensor offline"
        );
    }

    #[test]
    fn load_list_unload_roundtrip() {
        let (registry, pool, _) = setup();
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
        assert_eq!(registry.list_names(), vec!["cam"]);
        assert_eq!(registry.type_of("cam").as_deref(), Some(TRACKED));
        assert_eq!(pool.queue_count(), 2);

        let err = registry.load(LoadSpec::new("cam", TRACKED)).unwrap_err();
        assert!(matches!(err, RegistryError::NameTaken { ref name } if name == "cam"));
        assert_eq!(registry.len(), 1);

        registry.unload("cam").unwrap();
        assert!(registry.list_names().is_empty());
        assert_eq!(pool.queue_count(), 0);
    }

    #[test]
    fn list_is_sorted() {
        let (registry, _pool, _) = setup();
        for name in ["lidar", "cam", "imu"] {
            registry.load(LoadSpec::new(name, TRACKED)).unwrap();
        }
        assert_eq!(registry.list_names(), vec!["cam", "imu", "lidar"]);
    }

    #[test]
    fn unload_unknown_name_fails_without_side_effects() {
        let (registry, _pool, _) = setup();
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
        let err = registry.unload("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        assert_eq!(registry.list_names(), vec!["cam"]);
    }

    #[test]
    fn unknown_type_leaves_no_entry() {
        let (registry, pool, _) = setup();
        let err = registry.load(LoadSpec::new("cam", "test/Missing")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Factory {
                source: FactoryError::UnknownType { .. },
                ..
            }
        ));
        assert!(!registry.contains("cam"));
        assert_eq!(pool.queue_count(), 0);
    }

    #[test]
    fn failed_init_destroys_unit_and_queues() {
        let (registry, pool, tracker) = setup();
        let err = registry.load(LoadSpec::new("cam", FAILS_INIT)).unwrap_err();
        assert!(matches!(err, RegistryError::Init { .. }));
        assert!(registry.is_empty());
        assert_eq!(pool.queue_count(), 0);
        assert_eq!(tracker.created.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 1);

        // The name is free again.
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
    }

    #[test]
    fn liveness_id_requires_executor() {
        let (registry, pool, tracker) = setup();
        let err = registry
            .load(LoadSpec::new("cam", TRACKED).with_liveness_id("peer"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::LivenessUnavailable { ref id, .. } if id == "peer"));
        assert!(registry.is_empty());
        assert_eq!(pool.queue_count(), 0);
        assert_eq!(tracker.created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_liveness_id_is_ignored() {
        let (registry, _pool, _) = setup();
        registry
            .load(LoadSpec::new("cam", TRACKED).with_liveness_id(""))
            .unwrap();
        assert!(registry.contains("cam"));
    }

    #[test]
    fn load_fails_after_pool_stopped_or_released() {
        let (registry, pool, tracker) = setup();
        pool.stop();
        let err = registry.load(LoadSpec::new("cam", TRACKED)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Dispatch {
                source: DispatchError::PoolStopped,
                ..
            }
        ));
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 1);

        drop(pool);
        let err = registry.load(LoadSpec::new("cam", TRACKED)).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Dispatch {
                source: DispatchError::PoolReleased,
                ..
            }
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unload_disables_then_destroys_once() {
        let (registry, _pool, tracker) = setup();
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
        registry.unload("cam").unwrap();
        assert_eq!(tracker.disabled.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let (registry, pool, tracker) = setup();
        for name in ["a", "b", "c"] {
            registry.load(LoadSpec::new(name, TRACKED)).unwrap();
        }
        assert_eq!(registry.clear(), 3);
        assert!(registry.is_empty());
        assert_eq!(pool.queue_count(), 0);
        assert_eq!(tracker.disabled.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 3);
        assert_eq!(registry.clear(), 0);
    }

    #[test]
    fn concurrent_loads_of_one_name_admit_exactly_one() {
        let (registry, _pool, _) = setup();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.load(LoadSpec::new("cam", TRACKED)).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
        assert_eq!(registry.list_names(), vec!["cam"]);
    }

    #[test]
    fn unit_receives_context() {
        let seen: Arc<parking_lot::Mutex<Option<(String, Vec<String>, Option<String>)>>> =
            Arc::default();
        struct Recorder(Arc<parking_lot::Mutex<Option<(String, Vec<String>, Option<String>)>>>);
        impl Unit for Recorder {
            fn init(&mut self, ctx: &UnitContext) -> anyhow::Result<()> {
                *self.0.lock() = Some((
                    ctx.resolve_name("image").unwrap_or_default(),
                    ctx.args.clone(),
                    ctx.liveness_id.clone(),
                ));
                Ok(())
            }
        }

        let factory = TypeRegistryFactory::new();
        {
            let seen = Arc::clone(&seen);
            factory.register("test/Recorder", move || {
                Ok(Box::new(Recorder(Arc::clone(&seen))))
            });
        }
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let registry = UnitRegistry::new(Arc::new(factory), &pool, None, "/robot").unwrap();
        let remappings =
            RemapTable::from_args("/robot", &["image"], &["/camera/image_raw"]).unwrap();
        registry
            .load(
                LoadSpec::new("cam", "test/Recorder")
                    .with_remappings(remappings)
                    .with_args(vec!["--fps".to_string(), "30".to_string()]),
            )
            .unwrap();

        let (resolved, args, liveness_id) = seen.lock().clone().unwrap();
        assert_eq!(resolved, "/camera/image_raw");
        assert_eq!(args, vec!["--fps", "30"]);
        assert_eq!(liveness_id, None);
    }

    #[test]
    fn no_callback_runs_after_unit_destruction_begins() {
        let alive = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicU32::new(0));
        let delivered = Arc::new(AtomicU32::new(0));

        struct Sentinel {
            alive: Arc<AtomicBool>,
            violations: Arc<AtomicU32>,
            delivered: Arc<AtomicU32>,
        }
        impl Unit for Sentinel {
            fn init(&mut self, ctx: &UnitContext) -> anyhow::Result<()> {
                self.alive.store(true, Ordering::SeqCst);
                for _ in 0..200 {
                    let alive = Arc::clone(&self.alive);
                    let violations = Arc::clone(&self.violations);
                    let delivered = Arc::clone(&self.delivered);
                    ctx.queue(QueueClass::Ordinary).enqueue(move || {
                        thread::sleep(Duration::from_micros(200));
                        if !alive.load(Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        delivered.fetch_add(1, Ordering::SeqCst);
                    })?;
                }
                Ok(())
            }
        }
        impl Drop for Sentinel {
            fn drop(&mut self) {
                self.alive.store(false, Ordering::SeqCst);
            }
        }

        let factory = TypeRegistryFactory::new();
        {
            let (alive, violations, delivered) =
                (Arc::clone(&alive), Arc::clone(&violations), Arc::clone(&delivered));
            factory.register("test/Sentinel", move || {
                Ok(Box::new(Sentinel {
                    alive: Arc::clone(&alive),
                    violations: Arc::clone(&violations),
                    delivered: Arc::clone(&delivered),
                }))
            });
        }
        let pool = Arc::new(WorkerPool::new(4).unwrap());
        let registry = UnitRegistry::new(Arc::new(factory), &pool, None, "/").unwrap();
        registry.load(LoadSpec::new("s", "test/Sentinel")).unwrap();
        assert!(wait_until(|| delivered.load(Ordering::SeqCst) > 5));
        registry.unload("s").unwrap();

        let after_unload = delivered.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(delivered.load(Ordering::SeqCst), after_unload);
        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert!(!alive.load(Ordering::SeqCst));
    }

    #[test]
    fn unit_may_unload_itself_from_its_own_callback() {
        let (registry, pool, tracker) = setup();
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
        let queue = {
            let state = registry.state.lock();
            state.units["cam"].ordinary.handle()
        };
        let weak = Arc::downgrade(&registry);
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = Arc::clone(&done);
            queue
                .enqueue(move || {
                    if let Some(registry) = weak.upgrade() {
                        assert!(registry.unload("cam").is_ok());
                    }
                    done.store(true, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert!(wait_until(|| done.load(Ordering::SeqCst)));
        assert!(registry.is_empty());
        assert!(wait_until(|| pool.queue_count() == 0));
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 1);
    }

    fn liveness_setup(timeout_ms: u64) -> (Arc<UnitRegistry>, Arc<WorkerPool>, LivenessExecutor) {
        let (factory, _) = tracked_factory();
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let executor = LivenessExecutor::spawn(&LivenessConfig {
            heartbeat_timeout: Duration::from_millis(timeout_ms),
            tick_interval: Duration::from_millis(10),
        })
        .unwrap();
        let registry =
            UnitRegistry::new(factory, &pool, Some(executor.handle()), "/robot").unwrap();
        (registry, pool, executor)
    }

    #[test]
    fn liveness_break_unloads_unit() {
        let (registry, _pool, mut executor) = liveness_setup(30);
        assert_eq!(registry.liveness_topic(), "/robot/bond");
        registry
            .load(LoadSpec::new("cam", TRACKED).with_liveness_id("peer"))
            .unwrap();
        registry.load(LoadSpec::new("imu", TRACKED)).unwrap();
        assert!(executor.handle().heartbeat("peer"));

        assert!(wait_until(|| !registry.contains("cam")));
        assert_eq!(registry.list_names(), vec!["imu"]);
        assert_eq!(executor.handle().watched(), 0);
        executor.stop();
    }

    #[test]
    fn stale_break_leaves_reloaded_unit_alone() {
        let (registry, _pool, mut executor) = liveness_setup(60_000);
        registry
            .load(LoadSpec::new("cam", TRACKED).with_liveness_id("peer"))
            .unwrap();
        let first = registry.state.lock().units["cam"].generation;
        registry.unload("cam").unwrap();
        registry
            .load(LoadSpec::new("cam", TRACKED).with_liveness_id("peer"))
            .unwrap();

        unload_on_break(&Arc::downgrade(&registry), "cam", first);
        assert!(registry.contains("cam"));
        assert_eq!(executor.handle().watched(), 1);
        executor.stop();
    }

    #[test]
    fn stale_generation_remove_keeps_newer_unit() {
        let (registry, _pool, tracker) = setup();
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
        let first = registry.state.lock().units["cam"].generation;
        registry.unload("cam").unwrap();
        registry.load(LoadSpec::new("cam", TRACKED)).unwrap();
        let second = registry.state.lock().units["cam"].generation;
        assert_ne!(first, second);

        let err = registry.remove("cam", Some(first)).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        assert_eq!(registry.list_names(), vec!["cam"]);
        assert_eq!(tracker.created.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.disabled.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 1);

        registry.remove("cam", Some(second)).unwrap();
        assert!(registry.is_empty());
        assert_eq!(tracker.dropped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn break_after_registry_released_is_benign() {
        let (registry, _pool, mut executor) = liveness_setup(60_000);
        let weak = Arc::downgrade(&registry);
        drop(registry);
        unload_on_break(&weak, "cam", 0);
        executor.stop();
    }

    #[test]
    fn explicit_unload_racing_break_reports_not_found_once() {
        let (registry, _pool, mut executor) = liveness_setup(60_000);
        registry
            .load(LoadSpec::new("cam", TRACKED).with_liveness_id("peer"))
            .unwrap();
        let generation = registry.state.lock().units["cam"].generation;
        registry.unload("cam").unwrap();
        let err = registry.remove("cam", Some(generation)).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        executor.stop();
    }
}
