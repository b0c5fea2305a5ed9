//! Ephemeral SSH access
//!
//! Generates a fresh key pair per run, installs the public key for a user on
//! a managed host through the remote-execution collaborator, and schedules
//! its removal after a TTL.
//!
//! ## Lifecycle
//!
//! 1. Generate the pair and write it into the sandbox (private key 0600)
//! 2. Open a remote session and resolve the user's home directory
//! 3. Append the public key to `~/.ssh/authorized_keys` unless present
//! 4. Spawn a cleanup task: sleep TTL, filter the key out, close the session
//!
//! `provision` returns after step 3. Step 4 is best-effort and only logged.

pub mod generator;
pub mod remote;
pub mod types;

pub use generator::{Ed25519KeyGenerator, GeneratedKeyPair, KeyGenerator};
pub use remote::{RemoteExecutor, RemoteSession};
pub use types::{KeyAlgorithm, KeyPairArtifact};

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::error::ProvisioningError;
use super::sandbox::Sandbox;
use super::tasks::BackgroundTasks;
use crate::job::EphemeralKeyRequest;
use remote::{authorized_keys_path, install_script, remote_home, removal_script};

pub struct EphemeralKeyManager {
    generator: Arc<dyn KeyGenerator>,
    remote: Arc<dyn RemoteExecutor>,
    sandbox: Sandbox,
}

impl EphemeralKeyManager {
    pub fn new(
        generator: Arc<dyn KeyGenerator>,
        remote: Arc<dyn RemoteExecutor>,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            generator,
            remote,
            sandbox,
        }
    }

    /// Generate, install and schedule removal of an ephemeral key.
    ///
    /// The removal task is spawned into `cleanup` and is not awaited here.
    pub async fn provision(
        &self,
        request: &EphemeralKeyRequest,
        cleanup: &BackgroundTasks,
    ) -> Result<KeyPairArtifact, ProvisioningError> {
        info!(
            host = %request.target_host,
            user = %request.remote_user,
            key_name = %request.key_name,
            ttl_seconds = request.ttl_seconds,
            "Provisioning ephemeral SSH key"
        );

        let comment = format!("scan-runner:{}", request.key_name);
        let keypair = self
            .generator
            .generate(&comment)
            .context("Failed to generate key pair")
            .map_err(ProvisioningError::remote)?;

        let artifact = self.write_artifact(request, &keypair).await?;

        let session = self
            .remote
            .open_session(&request.target_host)
            .await
            .with_context(|| format!("Failed to open session to {}", request.target_host))
            .map_err(ProvisioningError::remote)?;

        let installed = async {
            let home = remote_home(session.as_ref(), &request.remote_user).await?;
            session
                .run(&install_script(&home, &artifact.public_key), Some(&request.remote_user))
                .await
                .context("Failed to install public key")?;
            Ok::<_, anyhow::Error>(authorized_keys_path(&home))
        }
        .await;

        let authorized_keys = match installed {
            Ok(path) => path,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    warn!(host = %session.host(), error = %close_err, "Failed to close remote session");
                }
                return Err(ProvisioningError::remote(e));
            }
        };

        info!(
            host = %request.target_host,
            user = %request.remote_user,
            fingerprint = %artifact.fingerprint,
            authorized_keys = %authorized_keys,
            "Public key installed"
        );

        schedule_removal(
            cleanup,
            session,
            request.remote_user.clone(),
            authorized_keys,
            artifact.public_key.clone(),
            ttl(request.ttl_seconds),
        );

        Ok(artifact)
    }

    async fn write_artifact(
        &self,
        request: &EphemeralKeyRequest,
        keypair: &GeneratedKeyPair,
    ) -> Result<KeyPairArtifact, ProvisioningError> {
        let private_key_path = self.sandbox.confine(Path::new(&request.key_name))?;
        let public_key_path = PathBuf::from(format!("{}.pub", private_key_path.display()));

        write_secret_file(&private_key_path, keypair.private_key_pem.as_bytes())
            .await
            .map_err(ProvisioningError::remote)?;
        tokio::fs::write(&public_key_path, format!("{}\n", keypair.public_key_openssh))
            .await
            .with_context(|| format!("Failed to write {}", public_key_path.display()))
            .map_err(ProvisioningError::remote)?;

        debug!(
            private_key = %private_key_path.display(),
            public_key = %public_key_path.display(),
            "Key pair written to sandbox"
        );

        Ok(KeyPairArtifact {
            private_key_path,
            public_key_path,
            public_key: keypair.public_key_openssh.clone(),
            fingerprint: keypair.fingerprint.clone(),
            algorithm: self.generator.algorithm(),
        })
    }
}

/// Non-positive TTLs fire immediately; removal is never skipped.
fn ttl(seconds: i64) -> Duration {
    Duration::from_secs(u64::try_from(seconds).unwrap_or(0))
}

fn schedule_removal(
    cleanup: &BackgroundTasks,
    session: Box<dyn RemoteSession>,
    user: String,
    authorized_keys: String,
    public_key: String,
    delay: Duration,
) {
    let label = format!("remove-key:{}", session.host());

    cleanup.spawn(label, async move {
        tokio::time::sleep(delay).await;

        let script = removal_script(&authorized_keys, &public_key);
        match session.run(&script, Some(&user)).await {
            Ok(_) => info!(
                host = %session.host(),
                authorized_keys = %authorized_keys,
                "Ephemeral key removed"
            ),
            Err(e) => warn!(
                host = %session.host(),
                error = %format!("{e:#}"),
                "Failed to remove ephemeral key"
            ),
        }

        if let Err(e) = session.close().await {
            warn!(host = %session.host(), error = %e, "Failed to close remote session");
        }
    });
}

/// Write a file readable only by the owner, replacing any previous content.
async fn write_secret_file(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .with_context(|| format!("Failed to restrict permissions on {}", path.display()))?;
    }

    Ok(())
}
