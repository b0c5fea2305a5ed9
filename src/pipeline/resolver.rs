//! Resource resolution
//!
//! Fetches one descriptor from its source and materializes it as a sandboxed
//! file or an environment variable. Descriptors are resolved strictly in
//! declaration order because later ones may rely on earlier side effects.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use super::environment::{ensure_unbound, validate_env_value, EnvStore};
use super::error::ProvisioningError;
use super::sandbox::Sandbox;
use crate::job::{ResolvedResource, ResourceDescriptor, ResourceDestination, ResourceSource};

/// Narrow read interface over the object, parameter and secret stores
#[async_trait]
pub trait ResourceSourceClient: Send + Sync {
    /// Object store get-by-key
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;

    /// Parameter store get, always with decryption
    async fn get_parameter(&self, name: &str) -> Result<Vec<u8>>;

    /// Secret store get-by-name
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>>;

    /// Decrypted instance password data, using a PEM launch key
    async fn get_password_data(&self, instance_id: &str, launch_key: &[u8]) -> Result<Vec<u8>>;
}

pub struct ResourceResolver<'a> {
    sources: &'a dyn ResourceSourceClient,
    env: &'a dyn EnvStore,
    sandbox: &'a Sandbox,
}

impl<'a> ResourceResolver<'a> {
    pub fn new(
        sources: &'a dyn ResourceSourceClient,
        env: &'a dyn EnvStore,
        sandbox: &'a Sandbox,
    ) -> Self {
        Self {
            sources,
            env,
            sandbox,
        }
    }

    /// Resolve a single descriptor.
    ///
    /// Destination checks (env conflicts, sandbox confinement) run before any
    /// source I/O.
    pub async fn resolve(
        &self,
        descriptor: &ResourceDescriptor,
    ) -> Result<ResolvedResource, ProvisioningError> {
        let target = match &descriptor.destination {
            ResourceDestination::EnvVar(name) => {
                ensure_unbound(self.env, name)?;
                ResolvedResource::EnvVar(name.clone())
            }
            ResourceDestination::File(path) => {
                ResolvedResource::File(self.sandbox.confine(path)?)
            }
        };

        let payload = self.fetch(&descriptor.source).await?;

        match &target {
            ResolvedResource::EnvVar(name) => {
                let value = String::from_utf8(payload).map_err(|_| {
                    ProvisioningError::ResourceFetch {
                        resource: descriptor.source.to_string(),
                        reason: format!("value for {name} is not valid UTF-8"),
                    }
                })?;
                validate_env_value(name, &value).map_err(|e| ProvisioningError::ResourceFetch {
                    resource: descriptor.source.to_string(),
                    reason: e.to_string(),
                })?;
                // Re-check: nothing else may have bound it while fetching
                ensure_unbound(self.env, name)?;
                self.env.set(name, &value);
                info!(
                    source = %descriptor.source,
                    env_variable = %name,
                    length = value.len(),
                    "Resource bound to environment"
                );
            }
            ResolvedResource::File(path) => {
                write_file(path, &payload).await.map_err(|e| {
                    ProvisioningError::ResourceFetch {
                        resource: descriptor.source.to_string(),
                        reason: format!("{e:#}"),
                    }
                })?;
                info!(
                    source = %descriptor.source,
                    path = %path.display(),
                    bytes = payload.len(),
                    "Resource written to sandbox"
                );
            }
        }

        Ok(target)
    }

    async fn fetch(&self, source: &ResourceSource) -> Result<Vec<u8>, ProvisioningError> {
        debug!(source = %source, "Fetching resource");

        let result = match source {
            ResourceSource::ObjectStore { bucket, key } => self.sources.get_object(bucket, key).await,
            ResourceSource::ParameterStore { name } => self.sources.get_parameter(name).await,
            ResourceSource::SecretStore { name } => self.sources.get_secret(name).await,
            ResourceSource::Ec2PasswordData {
                instance_id,
                launch_key_parameter,
            } => self.password_data(instance_id, launch_key_parameter).await,
        };

        result.map_err(|e| ProvisioningError::ResourceFetch {
            resource: source.to_string(),
            reason: format!("{e:#}"),
        })
    }
}

impl ResourceResolver<'_> {
    async fn password_data(&self, instance_id: &str, launch_key_parameter: &str) -> Result<Vec<u8>> {
        use anyhow::Context;

        let launch_key = self
            .sources
            .get_parameter(launch_key_parameter)
            .await
            .with_context(|| format!("Launch key {launch_key_parameter}"))?;
        self.sources.get_password_data(instance_id, &launch_key).await
    }
}

async fn write_file(path: &Path, payload: &[u8]) -> Result<()> {
    use anyhow::Context;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    tokio::fs::write(path, payload)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
