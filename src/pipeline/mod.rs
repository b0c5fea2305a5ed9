//! Provisioning pipeline
//!
//! Components that prepare the execution context for one scan run and the
//! coordinator that sequences them.

pub mod coordinator;
pub mod environment;
pub mod error;
pub mod publisher;
pub mod resolver;
pub mod sandbox;
pub mod scan;
pub mod ssh_key;
pub mod tasks;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{
    Collaborators, Diagnostic, PipelineContext, PipelineCoordinator, PipelineFailure,
    PipelineResult, PipelineSettings, PipelineStage,
};
pub use environment::{EnvStore, EnvironmentConfigurator, MemoryEnv, ProcessEnv};
pub use error::{ErrorKind, ProvisioningError};
pub use publisher::{Envelope, PublishResult, ResultPublisher, ResultSink};
pub use resolver::{ResourceResolver, ResourceSourceClient};
pub use sandbox::Sandbox;
pub use scan::{ExitStatus, ScanInvocation, ScanProcess};
pub use ssh_key::{EphemeralKeyManager, KeyGenerator, KeyPairArtifact, RemoteExecutor, RemoteSession};
pub use tasks::BackgroundTasks;
pub use tunnel::{TunnelBroker, TunnelReport, TunnelSessionManager};
