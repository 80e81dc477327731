//! Loader front-end: maps transport messages onto registry calls.
//!
//! Every registry failure is logged here and reported to the caller as a
//! plain `false`. Mismatched remapping lists are not fatal: the load goes
//! ahead with an empty remapping table.

use std::sync::Arc;

use tracing::{debug, error, info};
use unithost_core::messages::{
    HeartbeatResponse, ListResponse, LoadRequest, LoadResponse, PeerLostResponse,
    UnloadResponse,
};
use unithost_core::{LoaderRequest, LoaderResponse, RemapTable};

use crate::liveness::LivenessHandle;
use crate::registry::{LoadSpec, RegistryError, UnitRegistry};

/// Transport-agnostic adapter in front of a [`UnitRegistry`].
#[derive(Debug)]
pub struct LoaderService {
    registry: Arc<UnitRegistry>,
    liveness: Option<LivenessHandle>,
}

impl LoaderService {
    #[must_use]
    pub fn new(registry: Arc<UnitRegistry>, liveness: Option<LivenessHandle>) -> Self {
        Self { registry, liveness }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<UnitRegistry> {
        &self.registry
    }

    /// Dispatches one request to the matching operation.
    #[must_use]
    pub fn handle(&self, request: LoaderRequest) -> LoaderResponse {
        match request {
            LoaderRequest::Load(req) => LoaderResponse::Load(LoadResponse {
                success: self.load(req),
            }),
            LoaderRequest::Unload(req) => LoaderResponse::Unload(UnloadResponse {
                success: self.unload(&req.name),
            }),
            LoaderRequest::List(_) => LoaderResponse::List(ListResponse { units: self.list() }),
            LoaderRequest::Heartbeat(req) => LoaderResponse::Heartbeat(HeartbeatResponse {
                known: self.heartbeat(&req.bond_id),
            }),
            LoaderRequest::PeerLost(req) => LoaderResponse::PeerLost(PeerLostResponse {
                known: self.peer_lost(&req.bond_id),
            }),
        }
    }

    /// Loads a unit. Returns `false` if the registry refused it.
    #[must_use]
    pub fn load(&self, req: LoadRequest) -> bool {
        let remappings = match RemapTable::from_args(
            self.registry.namespace(),
            &req.remap_source_args,
            &req.remap_target_args,
        ) {
            Ok(table) => table,
            Err(e) => {
                error!(
                    "Bad remappings provided for unit '{}' ({e}); loading without remappings",
                    req.name
                );
                RemapTable::new()
            }
        };

        let mut spec = LoadSpec::new(req.name, req.type_name)
            .with_remappings(remappings)
            .with_args(req.my_argv);
        spec.liveness_id = req.bond_id.filter(|id| !id.is_empty());

        // The registry has already logged the failure.
        self.registry.load(spec).is_ok()
    }

    /// Unloads a unit. Returns `false` if no unit of that name is loaded.
    #[must_use]
    pub fn unload(&self, name: &str) -> bool {
        match self.registry.unload(name) {
            Ok(()) => true,
            Err(RegistryError::NotFound { .. }) => {
                error!("Failed to find unit with name '{name}' to unload.");
                false
            }
            Err(e) => {
                error!("Failed to unload unit '{name}': {e}");
                false
            }
        }
    }

    /// Names of the loaded units.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.registry.list_names()
    }

    /// Routes a peer heartbeat. Returns `false` if no liveness channel
    /// carries `bond_id`.
    #[must_use]
    pub fn heartbeat(&self, bond_id: &str) -> bool {
        let known = self
            .liveness
            .as_ref()
            .is_some_and(|handle| handle.heartbeat(bond_id));
        if !known {
            debug!("heartbeat for unknown liveness id '{bond_id}'");
        }
        known
    }

    /// Breaks every liveness channel bound to `bond_id`; units bound to it
    /// are unloaded on the liveness executor. Returns `false` if no started,
    /// unbroken channel carries the id.
    #[must_use]
    pub fn peer_lost(&self, bond_id: &str) -> bool {
        let known = self
            .liveness
            .as_ref()
            .is_some_and(|handle| handle.signal_broken(bond_id));
        if known {
            info!("peer '{bond_id}' reported lost");
        } else {
            debug!("peer-lost for unknown liveness id '{bond_id}'");
        }
        known
    }
}
