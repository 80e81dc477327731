//! The unit contract.
//!
//! A unit is a named processing component constructed by a
//! [`UnitFactory`] from a type name. The registry wires two dispatch queues
//! to it, calls [`Unit::init`] once, and calls [`Unit::disable`] before the
//! unit is destroyed. After `init`, unit state is mutated only from
//! callbacks delivered on its own queues.

pub mod builtin;
pub mod factory;

use unithost_core::RemapTable;

use crate::dispatch::{DispatchQueue, QueueClass};

pub use factory::{Constructor, FactoryError, TypeRegistryFactory, UnitFactory};

/// A dynamically loaded processing unit.
pub trait Unit: Send {
    /// Initialization entry point, called once while the registry lock is
    /// held. Must not block on work delivered through the dispatch queues.
    ///
    /// # Errors
    ///
    /// An error aborts the load; the unit is destroyed without being listed.
    fn init(&mut self, ctx: &UnitContext) -> anyhow::Result<()>;

    /// Signals the unit to stop accepting work and release its resources.
    fn disable(&mut self) {}
}

/// Everything a unit receives at initialization.
///
/// The context is dropped once `init` returns; units clone the queue
/// handles they need.
#[derive(Debug)]
pub struct UnitContext {
    pub name: String,
    pub type_name: String,
    pub namespace: String,
    pub remappings: RemapTable,
    pub args: Vec<String>,
    pub liveness_id: Option<String>,
    pub(crate) ordinary: DispatchQueue,
    pub(crate) priority: DispatchQueue,
}

impl UnitContext {
    /// Returns the unit's queue of the given class.
    #[must_use]
    pub fn queue(&self, class: QueueClass) -> &DispatchQueue {
        match class {
            QueueClass::Ordinary => &self.ordinary,
            QueueClass::Priority => &self.priority,
        }
    }

    /// Resolves `name` under the host namespace and applies the remappings.
    #[must_use]
    pub fn resolve_name(&self, name: &str) -> Option<String> {
        let resolved = unithost_core::names::resolve(&self.namespace, name).ok()?;
        Some(self.remappings.apply(&resolved).to_string())
    }
}
