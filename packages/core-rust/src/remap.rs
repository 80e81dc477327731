//! Remapping tables built from a load request.
//!
//! A remapping table maps a resolved source name to a resolved target name.
//! It parameterizes a unit's initialization and is not retained by the host
//! once the unit has been initialized.

use std::collections::BTreeMap;

use tracing::debug;

use crate::names::{self, NameError};

/// Errors produced while building a [`RemapTable`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemapError {
    #[error("bad remappings: {sources} source(s) but {targets} target(s)")]
    LengthMismatch { sources: usize, targets: usize },
    #[error("bad remapping name: {0}")]
    Name(#[from] NameError),
}

/// Ordered mapping of resolved source names to resolved target names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapTable {
    entries: BTreeMap<String, String>,
}

impl RemapTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from the parallel argument lists of a load request.
    ///
    /// Both sides are resolved against `namespace`. A later duplicate source
    /// overwrites an earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`RemapError::LengthMismatch`] if the lists differ in length
    /// and [`RemapError::Name`] if any name fails to resolve.
    pub fn from_args<S: AsRef<str>>(
        namespace: &str,
        sources: &[S],
        targets: &[S],
    ) -> Result<Self, RemapError> {
        if sources.len() != targets.len() {
            return Err(RemapError::LengthMismatch {
                sources: sources.len(),
                targets: targets.len(),
            });
        }

        let mut table = Self::new();
        for (source, target) in sources.iter().zip(targets) {
            let source = names::resolve(namespace, source.as_ref())?;
            let target = names::resolve(namespace, target.as_ref())?;
            debug!("remap {source} -> {target}");
            table.insert(source, target);
        }
        Ok(table)
    }

    /// Adds or replaces a mapping. Both names are expected to be resolved.
    pub fn insert(&mut self, source: String, target: String) {
        self.entries.insert(source, target);
    }

    /// Returns the target for `name`, or `name` itself if it is not remapped.
    #[must_use]
    pub fn apply<'a>(&'a self, name: &'a str) -> &'a str {
        self.entries.get(name).map_or(name, String::as_str)
    }

    /// Returns the mapped target for `source`, if any.
    #[must_use]
    pub fn get(&self, source: &str) -> Option<&str> {
        self.entries.get(source).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates mappings in source-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }
}
