//! Scan Runner
//!
//! Prepares a sandboxed execution context for a remote compliance scan
//! (resources, environment, ephemeral SSH access, port forwarding), runs the
//! scan engine and publishes its report.

pub mod config;
pub mod demos;
pub mod job;
pub mod pipeline;
pub mod runner;
pub mod telemetry;
pub mod tools;

pub use config::RunnerConfig;
pub use job::{ExecutionJob, JobDescription};
pub use pipeline::{PipelineCoordinator, PipelineResult, PipelineStage, ProvisioningError};
pub use runner::Runner;
