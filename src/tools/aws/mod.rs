//! AWS collaborators over the `aws` command line
//!
//! Every call spawns the CLI with `--output json` and parses stdout. The
//! region and, for SSM, a VPC endpoint override are applied to each call.

pub mod ec2;
pub mod s3;
pub mod secrets;
pub mod ssm;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::pipeline::publisher::ResultSink;
use crate::pipeline::resolver::ResourceSourceClient;

/// Default program name
pub const DEFAULT_AWS_CLI: &str = "aws";

/// Default upper bound on one remote command
pub const DEFAULT_REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
    ssm_endpoint: Option<String>,
    command_timeout: Duration,
    poll_interval: Duration,
}

impl Default for AwsCli {
    fn default() -> Self {
        Self::new(DEFAULT_AWS_CLI)
    }
}

impl AwsCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            region: None,
            ssm_endpoint: None,
            command_timeout: DEFAULT_REMOTE_COMMAND_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region.filter(|r| !r.trim().is_empty());
        self
    }

    /// Route SSM calls through a VPC endpoint.
    pub fn with_ssm_endpoint(mut self, raw: Option<&str>) -> Result<Self> {
        self.ssm_endpoint = match raw {
            Some(raw) => normalize_ssm_endpoint(raw)?,
            None => None,
        };
        if let Some(endpoint) = &self.ssm_endpoint {
            info!(endpoint = %endpoint, "Using SSM endpoint override");
        }
        Ok(self)
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn ssm_endpoint(&self) -> Option<&str> {
        self.ssm_endpoint.as_deref()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(region) = &self.region {
            cmd.args(["--region", region.as_str()]);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// `aws ssm ...` with the endpoint override applied.
    fn ssm_command(&self, args: &[&str]) -> Command {
        let mut cmd = self.command(&[&["ssm"][..], args].concat());
        if let Some(endpoint) = &self.ssm_endpoint {
            cmd.args(["--endpoint-url", endpoint.as_str()]);
        }
        cmd
    }

    /// Run to completion and return stdout.
    async fn output(&self, mut cmd: Command, action: &str) -> Result<Vec<u8>> {
        debug!(program = %self.program, action = %action, "Running AWS CLI");

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to run {} for {action}", self.program))?;

        if !output.status.success() {
            bail!(
                "{action} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    async fn output_json<T: DeserializeOwned>(&self, cmd: Command, action: &str) -> Result<T> {
        let stdout = self.output(cmd, action).await?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("Unexpected response from {action}"))
    }

    /// Run with `body` on stdin, keeping it off the command line.
    async fn output_with_stdin(&self, mut cmd: Command, body: &[u8], action: &str) -> Result<()> {
        debug!(program = %self.program, action = %action, bytes = body.len(), "Running AWS CLI");

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run {} for {action}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(body)
                .await
                .context("Failed to write request body to stdin")?;
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for AWS CLI")?;

        if !output.status.success() {
            bail!(
                "{action} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Normalize `SSM_ENDPOINT` to an https URL starting at the `vpce` host.
///
/// Endpoint DNS entries are often exported as `<zone-id>:vpce-...`; anything
/// before the first `vpce` is dropped. Blank values mean no override.
pub fn normalize_ssm_endpoint(raw: &str) -> Result<Option<String>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.find("vpce") {
        Some(start) => Ok(Some(format!("https://{}", &raw[start..]))),
        None => bail!("SSM_ENDPOINT does not name a VPC endpoint: {raw:?}"),
    }
}

#[async_trait]
impl ResourceSourceClient for AwsCli {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        s3::get_object(self, bucket, key).await
    }

    async fn get_parameter(&self, name: &str) -> Result<Vec<u8>> {
        ssm::get_parameter(self, name).await
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        secrets::get_secret(self, name).await
    }

    async fn get_password_data(&self, instance_id: &str, launch_key: &[u8]) -> Result<Vec<u8>> {
        ec2::get_password_data(self, instance_id, launch_key).await
    }
}

#[async_trait]
impl ResultSink for AwsCli {
    async fn put(&self, sink: &str, key: &str, body: Vec<u8>) -> Result<()> {
        s3::put_object(self, sink, key, &body).await
    }
}
