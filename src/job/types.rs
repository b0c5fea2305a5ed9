//! Validated job types
//!
//! Built once from a `JobDescription`; the pipeline only records resolved
//! outputs (credentials, resolved resources) back into the job.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Where a resource is read from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSource {
    /// Object store get-by-key
    ObjectStore { bucket: String, key: String },
    /// Parameter store get-with-decryption
    ParameterStore { name: String },
    /// Secret store get-by-name
    SecretStore { name: String },
    /// Windows administrator password of an instance, decrypted with the
    /// launch key held in the parameter store
    Ec2PasswordData {
        instance_id: String,
        launch_key_parameter: String,
    },
}

impl std::fmt::Display for ResourceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceSource::ObjectStore { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            ResourceSource::ParameterStore { name } => write!(f, "ssm-parameter:{name}"),
            ResourceSource::SecretStore { name } => write!(f, "secret:{name}"),
            ResourceSource::Ec2PasswordData { instance_id, .. } => {
                write!(f, "ec2-password-data:{instance_id}")
            }
        }
    }
}

/// Where a fetched resource is materialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "locator", rename_all = "snake_case")]
pub enum ResourceDestination {
    /// File path, confined to the sandbox at resolution time
    File(PathBuf),
    /// Environment variable name
    EnvVar(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub source: ResourceSource,
    pub destination: ResourceDestination,
}

/// Outcome of resolving one descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "locator", rename_all = "snake_case")]
pub enum ResolvedResource {
    File(PathBuf),
    EnvVar(String),
}

/// Request for short-lived SSH access to a managed host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralKeyRequest {
    /// Instance id or address
    pub target_host: String,
    pub remote_user: String,
    /// File name of the key inside the sandbox
    pub key_name: String,
    /// Non-positive values remove the key immediately after install
    pub ttl_seconds: i64,
}

/// Port forwarding request; one session per port, same port on both ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub target_host: String,
    pub ports: BTreeSet<u16>,
}

/// A named results destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkSpec {
    pub locator: String,
    /// Envelope tags; the runner default is used when absent
    pub tags: Option<String>,
}

/// Aggregate root for one invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    pub scan_command: String,
    /// Used to name the report file and the published object key
    pub results_name: String,
    pub env_overrides: IndexMap<String, String>,
    pub resources: Vec<ResourceDescriptor>,
    pub key_request: Option<EphemeralKeyRequest>,
    pub tunnel_spec: Option<TunnelSpec>,
    pub result_sinks: Vec<SinkSpec>,
    /// Private key paths made available to the scan
    #[serde(default)]
    pub credentials: Vec<PathBuf>,
    /// Filled in as resources resolve, in declaration order
    #[serde(default)]
    pub resolved: Vec<ResolvedResource>,
}
