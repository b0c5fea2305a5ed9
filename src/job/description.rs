//! Incoming job description
//!
//! The loosely shaped JSON event is parsed here and turned into an
//! `ExecutionJob` by a single validation pass. Ambiguous shapes are rejected
//! before the pipeline starts.

use indexmap::IndexMap;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use super::types::{
    EphemeralKeyRequest, ExecutionJob, ResourceDescriptor, ResourceDestination, ResourceSource,
    SinkSpec, TunnelSpec,
};
use crate::pipeline::environment::{validate_env_name, validate_env_value};
use crate::pipeline::ProvisioningError;

/// Results name used when the job does not provide one
pub const DEFAULT_RESULTS_NAME: &str = "unnamed_profile";

/// Raw job description as received from the invocation transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescription {
    /// Full scan command line (e.g. `inspec exec <profile> -t ssh://...`)
    pub command: String,
    #[serde(default)]
    pub results_name: Option<String>,
    #[serde(default)]
    pub results_buckets: Vec<SinkDescription>,
    /// Comma separated tags applied to every sink without its own tags
    #[serde(default)]
    pub eval_tags: Option<String>,
    #[serde(default, deserialize_with = "unique_keys")]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub resources: Vec<ResourceDescription>,
    #[serde(default)]
    pub tmp_ssm_ssh_key: Option<KeyDescription>,
    #[serde(default)]
    pub ssm_port_forward: Option<PortForwardDescription>,
}

/// A results bucket, either a bare name or a name with its own tags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SinkDescription {
    Name(String),
    Tagged {
        bucket: String,
        #[serde(default)]
        eval_tags: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDescription {
    #[serde(default)]
    pub local_file_path: Option<PathBuf>,
    #[serde(default)]
    pub env_variable: Option<String>,
    #[serde(default)]
    pub source_aws_s3_bucket: Option<String>,
    #[serde(default)]
    pub source_aws_s3_key: Option<String>,
    #[serde(default)]
    pub source_aws_ssm_parameter_key: Option<String>,
    #[serde(default)]
    pub source_aws_secrets_manager_secret_id: Option<String>,
    #[serde(default)]
    pub source_aws_ec2_password_data: Option<PasswordDataDescription>,
}

/// Windows password of an instance launched with a key pair whose private
/// key sits in the parameter store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PasswordDataDescription {
    pub instance_id: String,
    pub launch_key_ssm_parameter: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyDescription {
    pub host: String,
    pub user: String,
    pub key_name: String,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortForwardDescription {
    pub instance_id: String,
    pub ports: Vec<u16>,
}

/// Defaults the validation pass fills in
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub key_ttl_seconds: i64,
}

impl JobDescription {
    pub fn from_json(json: &str) -> Result<Self, ProvisioningError> {
        serde_json::from_str(json)
            .map_err(|e| ProvisioningError::config(format!("Invalid job description: {e}")))
    }

    /// Validate into an `ExecutionJob`.
    pub fn validate(self, defaults: &JobDefaults) -> Result<ExecutionJob, ProvisioningError> {
        let scan_command = self.command.trim().to_string();
        if scan_command.is_empty() {
            return Err(ProvisioningError::config("command must not be empty"));
        }

        let results_name = match self.results_name {
            Some(name) if name.trim().is_empty() => {
                return Err(ProvisioningError::config("results_name must not be blank"))
            }
            Some(name) if name.contains('/') => {
                return Err(ProvisioningError::config(format!(
                    "results_name must not contain '/': {name}"
                )))
            }
            Some(name) => name,
            None => DEFAULT_RESULTS_NAME.to_string(),
        };

        for (name, value) in &self.env {
            validate_env_name(name)?;
            validate_env_value(name, value)?;
        }

        let resources = self
            .resources
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                raw.into_descriptor().map_err(|e| match e {
                    ProvisioningError::Configuration(msg) => {
                        ProvisioningError::config(format!("resources[{index}]: {msg}"))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let key_request = self
            .tmp_ssm_ssh_key
            .map(|raw| raw.into_request(defaults.key_ttl_seconds))
            .transpose()?;

        let tunnel_spec = self
            .ssm_port_forward
            .map(PortForwardDescription::into_spec)
            .transpose()?;

        let result_sinks = self
            .results_buckets
            .into_iter()
            .map(|sink| sink.into_spec(self.eval_tags.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        let job = ExecutionJob {
            scan_command,
            results_name,
            env_overrides: self.env,
            resources,
            key_request,
            tunnel_spec,
            result_sinks,
            credentials: Vec::new(),
            resolved: Vec::new(),
        };

        debug!(
            resources = job.resources.len(),
            sinks = job.result_sinks.len(),
            key_request = job.key_request.is_some(),
            tunnel = job.tunnel_spec.is_some(),
            "Job description validated"
        );

        Ok(job)
    }
}

impl ResourceDescription {
    /// Exactly one source and one destination must be populated.
    pub fn into_descriptor(self) -> Result<ResourceDescriptor, ProvisioningError> {
        let mut sources = Vec::new();

        match (self.source_aws_s3_bucket, self.source_aws_s3_key) {
            (Some(bucket), Some(key)) => sources.push(ResourceSource::ObjectStore { bucket, key }),
            (None, None) => {}
            _ => {
                return Err(ProvisioningError::config(
                    "source_aws_s3_bucket and source_aws_s3_key must be given together",
                ))
            }
        }
        if let Some(name) = self.source_aws_ssm_parameter_key {
            sources.push(ResourceSource::ParameterStore { name });
        }
        if let Some(name) = self.source_aws_secrets_manager_secret_id {
            sources.push(ResourceSource::SecretStore { name });
        }
        if let Some(password) = self.source_aws_ec2_password_data {
            sources.push(ResourceSource::Ec2PasswordData {
                instance_id: password.instance_id,
                launch_key_parameter: password.launch_key_ssm_parameter,
            });
        }

        let source = match sources.len() {
            0 => return Err(ProvisioningError::config("resource has no source")),
            1 => sources.remove(0),
            n => {
                return Err(ProvisioningError::config(format!(
                    "resource has {n} sources, expected exactly one"
                )))
            }
        };

        let destination = match (self.local_file_path, self.env_variable) {
            (Some(path), None) => ResourceDestination::File(path),
            (None, Some(name)) => {
                validate_env_name(&name)?;
                ResourceDestination::EnvVar(name)
            }
            (None, None) => return Err(ProvisioningError::config("resource has no destination")),
            (Some(_), Some(_)) => {
                return Err(ProvisioningError::config(
                    "resource has both local_file_path and env_variable",
                ))
            }
        };

        if let Some(empty) = blank_locator(&source) {
            return Err(ProvisioningError::config(format!("{empty} must not be empty")));
        }

        Ok(ResourceDescriptor {
            source,
            destination,
        })
    }
}

fn blank_locator(source: &ResourceSource) -> Option<&'static str> {
    match source {
        ResourceSource::ObjectStore { bucket, .. } if bucket.is_empty() => {
            Some("source_aws_s3_bucket")
        }
        ResourceSource::ObjectStore { key, .. } if key.is_empty() => Some("source_aws_s3_key"),
        ResourceSource::ParameterStore { name } if name.is_empty() => {
            Some("source_aws_ssm_parameter_key")
        }
        ResourceSource::SecretStore { name } if name.is_empty() => {
            Some("source_aws_secrets_manager_secret_id")
        }
        ResourceSource::Ec2PasswordData { instance_id, .. } if instance_id.trim().is_empty() => {
            Some("source_aws_ec2_password_data.instance_id")
        }
        ResourceSource::Ec2PasswordData {
            launch_key_parameter,
            ..
        } if launch_key_parameter.is_empty() => {
            Some("source_aws_ec2_password_data.launch_key_ssm_parameter")
        }
        _ => None,
    }
}

impl KeyDescription {
    fn into_request(self, default_ttl: i64) -> Result<EphemeralKeyRequest, ProvisioningError> {
        for (field, value) in [
            ("host", &self.host),
            ("user", &self.user),
            ("key_name", &self.key_name),
        ] {
            if value.trim().is_empty() {
                return Err(ProvisioningError::config(format!(
                    "tmp_ssm_ssh_key.{field} must not be empty"
                )));
            }
        }

        Ok(EphemeralKeyRequest {
            target_host: self.host,
            remote_user: self.user,
            key_name: self.key_name,
            ttl_seconds: self.ttl_seconds.unwrap_or(default_ttl),
        })
    }
}

impl PortForwardDescription {
    fn into_spec(self) -> Result<TunnelSpec, ProvisioningError> {
        if self.instance_id.trim().is_empty() {
            return Err(ProvisioningError::config(
                "ssm_port_forward.instance_id must not be empty",
            ));
        }
        if self.ports.is_empty() {
            return Err(ProvisioningError::config("ssm_port_forward.ports must not be empty"));
        }

        let mut ports = BTreeSet::new();
        for port in self.ports {
            if port == 0 {
                return Err(ProvisioningError::config("ssm_port_forward port 0 is invalid"));
            }
            if !ports.insert(port) {
                return Err(ProvisioningError::config(format!(
                    "ssm_port_forward port {port} is listed twice"
                )));
            }
        }

        Ok(TunnelSpec {
            target_host: self.instance_id,
            ports,
        })
    }
}

impl SinkDescription {
    fn into_spec(self, job_tags: Option<&str>) -> Result<SinkSpec, ProvisioningError> {
        let (locator, tags) = match self {
            SinkDescription::Name(bucket) => (bucket, job_tags.map(str::to_string)),
            SinkDescription::Tagged { bucket, eval_tags } => {
                (bucket, eval_tags.or_else(|| job_tags.map(str::to_string)))
            }
        };
        if locator.trim().is_empty() {
            return Err(ProvisioningError::config("results bucket name must not be empty"));
        }
        Ok(SinkSpec { locator, tags })
    }
}

/// Deserialize a string map, rejecting duplicate keys instead of keeping the
/// last one.
fn unique_keys<'de, D>(deserializer: D) -> Result<IndexMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct UniqueKeys;

    impl<'de> Visitor<'de> for UniqueKeys {
        type Value = IndexMap<String, String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of environment variable names to string values")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut map = IndexMap::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<String, String>()? {
                if map.contains_key(&key) {
                    return Err(serde::de::Error::custom(format!(
                        "duplicate environment variable: {key}"
                    )));
                }
                map.insert(key, value);
            }
            Ok(map)
        }
    }

    deserializer.deserialize_map(UniqueKeys)
}
