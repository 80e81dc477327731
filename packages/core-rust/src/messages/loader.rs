//! Load, unload, list, heartbeat and peer-lost messages.

use serde::{Deserialize, Serialize};

/// Request to instantiate a unit by name and type.
///
/// `remap_source_args` and `remap_target_args` are parallel lists. A
/// non-empty `bond_id` binds the unit to a liveness channel whose loss
/// unloads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub remap_source_args: Vec<String>,
    #[serde(default)]
    pub remap_target_args: Vec<String>,
    #[serde(default)]
    pub my_argv: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bond_id: Option<String>,
}

impl LoadRequest {
    /// Creates a request without remappings, arguments, or liveness binding.
    #[must_use]
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            ..Self::default()
        }
    }

    /// Returns the liveness id if one was supplied and is non-empty.
    #[must_use]
    pub fn liveness_id(&self) -> Option<&str> {
        self.bond_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResponse {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadRequest {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {}

/// Names of the currently loaded units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub units: Vec<String>,
}

/// Heartbeat from the remote peer of a liveness channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub bond_id: String,
}

/// `known` is `false` when no started channel carries the given id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub known: bool,
}

/// Explicit notice that the remote peer of a liveness channel is gone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLostRequest {
    pub bond_id: String,
}

/// `known` is `false` when no started, unbroken channel carries the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLostResponse {
    pub known: bool,
}

/// Any request accepted by the loader front-end, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LoaderRequest {
    Load(LoadRequest),
    Unload(UnloadRequest),
    List(ListRequest),
    Heartbeat(HeartbeatRequest),
    PeerLost(PeerLostRequest),
}

/// Response matching the [`LoaderRequest`] variant it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum LoaderResponse {
    Load(LoadResponse),
    Unload(UnloadResponse),
    List(ListResponse),
    Heartbeat(HeartbeatResponse),
    PeerLost(PeerLostResponse),
    /// The request line could not be parsed.
    Error { message: String },
}
