//! Pipeline error taxonomy
//!
//! Every component returns `ProvisioningError`. Collaborators (AWS CLI,
//! shell processes) work in `anyhow` and are converted at the component
//! boundary with their full context chain.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while provisioning and running a scan job
#[derive(Debug, Error)]
pub enum ProvisioningError {
    /// Malformed or ambiguous job / descriptor (pipeline never starts)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Attempted overwrite of an existing environment binding
    #[error("Environment variable already set: {name}")]
    EnvConflict { name: String },

    /// Source read failed
    #[error("Failed to fetch {resource}: {reason}")]
    ResourceFetch { resource: String, reason: String },

    /// Key generation or remote install failed
    #[error("Remote execution failed: {0}")]
    RemoteExec(String),

    /// A forwarding session could not be started
    #[error("Tunnel session for port {port} failed to start: {reason}")]
    TunnelStart { port: u16, reason: String },

    /// The scan process exited non-zero or could not be run
    #[error("Scan process error: {0}")]
    ScanProcess(String),

    /// Publishing to one sink failed
    #[error("Failed to publish results to {sink}: {reason}")]
    ResultPublish { sink: String, reason: String },
}

/// Stable category names, used in diagnostics and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    EnvConflict,
    ResourceFetch,
    RemoteExec,
    TunnelStart,
    ScanProcess,
    ResultPublish,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::EnvConflict => "env_conflict",
            ErrorKind::ResourceFetch => "resource_fetch",
            ErrorKind::RemoteExec => "remote_exec",
            ErrorKind::TunnelStart => "tunnel_start",
            ErrorKind::ScanProcess => "scan_process",
            ErrorKind::ResultPublish => "result_publish",
        };
        write!(f, "{name}")
    }
}

impl ProvisioningError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProvisioningError::Configuration(_) => ErrorKind::Configuration,
            ProvisioningError::EnvConflict { .. } => ErrorKind::EnvConflict,
            ProvisioningError::ResourceFetch { .. } => ErrorKind::ResourceFetch,
            ProvisioningError::RemoteExec(_) => ErrorKind::RemoteExec,
            ProvisioningError::TunnelStart { .. } => ErrorKind::TunnelStart,
            ProvisioningError::ScanProcess(_) => ErrorKind::ScanProcess,
            ProvisioningError::ResultPublish { .. } => ErrorKind::ResultPublish,
        }
    }

    /// Whether this error aborts the pipeline.
    ///
    /// Tunnel, scan and publish failures degrade into diagnostics instead.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProvisioningError::TunnelStart { .. }
                | ProvisioningError::ScanProcess(_)
                | ProvisioningError::ResultPublish { .. }
        )
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        ProvisioningError::Configuration(message.into())
    }

    pub(crate) fn remote(err: anyhow::Error) -> Self {
        ProvisioningError::RemoteExec(format!("{err:#}"))
    }
}
