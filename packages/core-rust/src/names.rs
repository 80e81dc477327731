//! Graph-name resolution.
//!
//! Every name handed to a unit (remapping sources and targets, liveness
//! topics) is resolved against the host namespace before use:
//!
//! - absolute names (`/a/b`) are kept as-is,
//! - private names (`~x`) resolve under the namespace itself,
//! - relative names (`x/y`) resolve under the namespace.
//!
//! Repeated and trailing separators are collapsed, so resolution is
//! idempotent: resolving an already-resolved name returns it unchanged.

use std::sync::LazyLock;

use regex::Regex;

/// Separator between graph-name segments.
pub const SEPARATOR: char = '/';

/// Prefix marking a private name.
pub const PRIVATE_PREFIX: char = '~';

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("segment pattern is a valid regex")
});

/// Errors produced while resolving a graph name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("graph name is empty")]
    Empty,
    #[error("invalid graph name {name:?}: {reason}")]
    Invalid { name: String, reason: &'static str },
}

/// Normalizes a namespace into its absolute form.
///
/// The empty namespace is the root (`/`). A namespace without a leading
/// separator is treated as if it had one.
///
/// # Errors
///
/// Returns [`NameError::Invalid`] if any segment is malformed or the
/// namespace contains a private marker.
pub fn normalize_namespace(namespace: &str) -> Result<String, NameError> {
    if namespace.contains(PRIVATE_PREFIX) {
        return Err(NameError::Invalid {
            name: namespace.to_string(),
            reason: "namespace cannot be private",
        });
    }
    join_segments(namespace, std::iter::empty())
}

/// Resolves `name` against `namespace`.
///
/// # Errors
///
/// Returns [`NameError::Empty`] for an empty name and
/// [`NameError::Invalid`] when the name or namespace is malformed.
pub fn resolve(namespace: &str, name: &str) -> Result<String, NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    let ns = normalize_namespace(namespace)?;

    if let Some(rest) = name.strip_prefix(PRIVATE_PREFIX) {
        if rest.contains(PRIVATE_PREFIX) {
            return Err(invalid(name, "'~' is only allowed as the first character"));
        }
        return join_segments(&ns, rest.split(SEPARATOR)).map_err(|_| invalid(name, "bad segment"));
    }
    if name.contains(PRIVATE_PREFIX) {
        return Err(invalid(name, "'~' is only allowed as the first character"));
    }
    if name.starts_with(SEPARATOR) {
        return join_segments(name, std::iter::empty());
    }
    join_segments(&ns, name.split(SEPARATOR)).map_err(|_| invalid(name, "bad segment"))
}

/// Joins a relative `suffix` under `namespace`, e.g. `qualify("/robot", "bond")`
/// yields `/robot/bond`.
///
/// # Errors
///
/// Same as [`resolve`].
pub fn qualify(namespace: &str, suffix: &str) -> Result<String, NameError> {
    resolve(namespace, suffix.trim_start_matches(SEPARATOR))
}

/// Returns `true` if `name` resolves under the root namespace.
#[must_use]
pub fn is_valid(name: &str) -> bool {
    resolve("/", name).is_ok()
}

fn join_segments<'a>(
    base: &'a str,
    extra: impl Iterator<Item = &'a str>,
) -> Result<String, NameError> {
    let mut out = String::with_capacity(base.len() + 16);
    for segment in base
        .split(SEPARATOR)
        .chain(extra)
        .filter(|s| !s.is_empty())
    {
        if !SEGMENT.is_match(segment) {
            return Err(invalid(base, "segments must match [A-Za-z_][A-Za-z0-9_]*"));
        }
        out.push(SEPARATOR);
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push(SEPARATOR);
    }
    Ok(out)
}

fn invalid(name: &str, reason: &'static str) -> NameError {
    NameError::Invalid {
        name: name.to_string(),
        reason,
    }
}
