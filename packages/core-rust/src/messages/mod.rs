//! Request/response schemas of the loader front-end.
//!
//! All types use camelCase field names. The `unit-host` binary carries them
//! as JSON lines; any other transport can reuse the same serde derives.

pub mod loader;

pub use loader::{
    HeartbeatRequest, HeartbeatResponse, ListRequest, ListResponse, LoadRequest, LoadResponse,
    LoaderRequest, LoaderResponse, PeerLostRequest, PeerLostResponse, UnloadRequest,
    UnloadResponse,
};
