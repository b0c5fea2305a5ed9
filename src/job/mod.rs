//! Job description handling
//!
//! Parses the incoming JSON job and validates it into an `ExecutionJob`.

pub mod description;
pub mod types;

pub use description::{JobDefaults, JobDescription, DEFAULT_RESULTS_NAME};
pub use types::{
    EphemeralKeyRequest, ExecutionJob, ResolvedResource, ResourceDescriptor, ResourceDestination,
    ResourceSource, SinkSpec, TunnelSpec,
};
