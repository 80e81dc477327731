//! `unithost` core: graph-name resolution, remapping tables, and the
//! loader front-end message schemas.

pub mod messages;
pub mod names;
pub mod remap;

pub use messages::{LoadRequest, LoaderRequest, LoaderResponse};
pub use names::NameError;
pub use remap::{RemapError, RemapTable};
