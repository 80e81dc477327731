//! Unit types shipped with the host binary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context as _;
use tracing::{debug, info};

use super::{TypeRegistryFactory, Unit, UnitContext};
use crate::dispatch::QueueClass;

pub const ECHO_TYPE: &str = "unithost/Echo";
pub const COUNTER_TYPE: &str = "unithost/Counter";

/// Logs its arguments and remappings when initialized.
#[derive(Debug, Default)]
pub struct EchoUnit {
    name: String,
}

impl Unit for EchoUnit {
    fn init(&mut self, ctx: &UnitContext) -> anyhow::Result<()> {
        self.name.clone_from(&ctx.name);
        info!("echo unit '{}' initialized with args {:?}", ctx.name, ctx.args);
        for (source, target) in ctx.remappings.iter() {
            info!("echo unit '{}' remaps {source} -> {target}", ctx.name);
        }
        Ok(())
    }

    fn disable(&mut self) {
        info!("echo unit '{}' disabled", self.name);
    }
}

/// Posts a number of callbacks on its queues and counts their delivery.
///
/// The first argument gives the number of ordinary callbacks (default 1);
/// one more is always posted on the priority queue.
#[derive(Debug, Default)]
pub struct CounterUnit {
    delivered: Arc<AtomicU64>,
}

impl CounterUnit {
    /// Creates a counter reporting into `delivered`.
    #[must_use]
    pub fn with_counter(delivered: Arc<AtomicU64>) -> Self {
        Self { delivered }
    }

    /// Callbacks delivered so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }
}

impl Unit for CounterUnit {
    fn init(&mut self, ctx: &UnitContext) -> anyhow::Result<()> {
        let count: u64 = match ctx.args.first() {
            Some(arg) => arg
                .parse()
                .with_context(|| format!("invalid callback count {arg:?}"))?,
            None => 1,
        };

        let priority = Arc::clone(&self.delivered);
        ctx.queue(QueueClass::Priority).enqueue(move || {
            priority.fetch_add(1, Ordering::AcqRel);
        })?;
        for _ in 0..count {
            let delivered = Arc::clone(&self.delivered);
            ctx.queue(QueueClass::Ordinary).enqueue(move || {
                delivered.fetch_add(1, Ordering::AcqRel);
            })?;
        }
        debug!("counter unit '{}' posted {} callback(s)", ctx.name, count.saturating_add(1));
        Ok(())
    }
}

/// Factory with the built-in unit types registered.
#[must_use]
pub fn builtin_factory() -> TypeRegistryFactory {
    let factory = TypeRegistryFactory::new();
    factory.register_default::<EchoUnit>(ECHO_TYPE);
    factory.register_default::<CounterUnit>(COUNTER_TYPE);
    factory
}
