//! Factories turning a type name into a constructed unit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;

use super::Unit;

/// Errors produced while constructing a unit.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    #[error("unknown unit type {type_name:?}")]
    UnknownType { type_name: String },
    #[error("failed to construct unit of type {type_name:?}: {reason}")]
    Construction { type_name: String, reason: String },
}

/// Constructs units by type name. The returned instance is owned by the
/// caller from then on.
pub trait UnitFactory: Send + Sync {
    /// Creates a new, uninitialized unit of `type_name`.
    ///
    /// # Errors
    ///
    /// Returns [`FactoryError::UnknownType`] for an undeclared type and
    /// [`FactoryError::Construction`] when construction fails.
    fn create(&self, type_name: &str) -> Result<Box<dyn Unit>, FactoryError>;

    /// Type names this factory can construct, sorted.
    fn declared_types(&self) -> Vec<String>;
}

/// Constructor registered for one type name.
pub type Constructor = Arc<dyn Fn() -> anyhow::Result<Box<dyn Unit>> + Send + Sync>;

/// In-process factory keyed by type name.
///
/// A constructor that returns an error or panics yields
/// [`FactoryError::Construction`]; the panic does not cross this boundary.
#[derive(Default)]
pub struct TypeRegistryFactory {
    constructors: DashMap<String, Constructor>,
}

impl TypeRegistryFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `constructor` under `type_name`, replacing any previous one.
    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn() -> anyhow::Result<Box<dyn Unit>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    /// Registers a type constructed through its `Default` impl.
    pub fn register_default<U>(&self, type_name: &str)
    where
        U: Unit + Default + 'static,
    {
        self.register(type_name, || Ok(Box::new(U::default())));
    }

    #[must_use]
    pub fn is_declared(&self, type_name: &str) -> bool {
        self.constructors.contains_key(type_name)
    }
}

impl UnitFactory for TypeRegistryFactory {
    fn create(&self, type_name: &str) -> Result<Box<dyn Unit>, FactoryError> {
        // Cloned out so no map guard is held while user code runs.
        let constructor = self
            .constructors
            .get(type_name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FactoryError::UnknownType {
                type_name: type_name.to_string(),
            })?;

        match catch_unwind(AssertUnwindSafe(|| constructor())) {
            Ok(Ok(unit)) => Ok(unit),
            Ok(Err(e)) => Err(FactoryError::Construction {
                type_name: type_name.to_string(),
                reason: format!("{e:#}"),
            }),
            Err(payload) => Err(FactoryError::Construction {
                type_name: type_name.to_string(),
                reason: panic_message(payload.as_ref()),
            }),
        }
    }

    fn declared_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .constructors
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        types.sort();
        types
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("constructor panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("constructor panicked: {s}")
    } else {
        "constructor panicked".to_string()
    }
}
