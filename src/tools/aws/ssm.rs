//! Systems Manager: parameters, remote commands and port forwarding
//!
//! Remote commands go through `send-command` with the `AWS-RunShellScript`
//! document, which runs as root; a target user is reached with `sudo`.
//! Port forwarding uses a detached `start-session` process per port.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::AwsCli;
use crate::pipeline::ssh_key::remote::shell_quote;
use crate::pipeline::ssh_key::{RemoteExecutor, RemoteSession};
use crate::pipeline::tasks::BackgroundTasks;
use crate::pipeline::tunnel::TunnelBroker;

const RUN_SHELL_DOCUMENT: &str = "AWS-RunShellScript";
const PORT_FORWARD_DOCUMENT: &str = "AWS-StartPortForwardingSession";
const SSH_DOCUMENT: &str = "AWS-StartSSHSession";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterResponse {
    parameter: Parameter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Parameter {
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceInformationList {
    instance_information_list: Vec<InstanceInformation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceInformation {
    instance_id: String,
    ping_status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendCommandResponse {
    command: SentCommand,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SentCommand {
    command_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CommandInvocation {
    status: String,
    #[serde(default)]
    response_code: Option<i64>,
    #[serde(default)]
    standard_output_content: String,
    #[serde(default)]
    standard_error_content: String,
}

/// Where a polled invocation stands
#[derive(Debug, PartialEq, Eq)]
enum InvocationState {
    Running,
    Succeeded(String),
    Failed(String),
}

pub async fn get_parameter(cli: &AwsCli, name: &str) -> Result<Vec<u8>> {
    let cmd = cli.ssm_command(&[
        "get-parameter",
        "--name",
        name,
        "--with-decryption",
        "--output",
        "json",
    ]);
    let response: GetParameterResponse = cli
        .output_json(cmd, &format!("ssm get-parameter {name}"))
        .await?;
    Ok(response.parameter.value.into_bytes())
}

/// `send-command` parameters for a single script.
fn run_shell_parameters(script: &str) -> String {
    json!({ "commands": [script] }).to_string()
}

/// Run `command` as `user` through a login-less `sh`.
fn as_user(command: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!(
            "sudo -u {} -H sh -c {}",
            shell_quote(user),
            shell_quote(command)
        ),
        None => command.to_string(),
    }
}

fn port_forward_parameters(port: u16) -> String {
    json!({
        "portNumber": [port.to_string()],
        "localPortNumber": [port.to_string()],
    })
    .to_string()
}

fn ensure_online(stdout: &[u8], instance_id: &str) -> Result<()> {
    let list: InstanceInformationList = serde_json::from_slice(stdout)
        .context("Unexpected describe-instance-information response")?;

    let info = list
        .instance_information_list
        .iter()
        .find(|i| i.instance_id == instance_id)
        .ok_or_else(|| anyhow!("{instance_id} is not a managed instance"))?;

    if info.ping_status != "Online" {
        bail!("{instance_id} is {}", info.ping_status);
    }
    Ok(())
}

fn invocation_state(stdout: &[u8]) -> Result<InvocationState> {
    let invocation: CommandInvocation = serde_json::from_slice(stdout)
        .context("Unexpected get-command-invocation response")?;

    Ok(match invocation.status.as_str() {
        "Pending" | "InProgress" | "Delayed" => InvocationState::Running,
        "Success" => InvocationState::Succeeded(invocation.standard_output_content),
        status => InvocationState::Failed(format!(
            "{status} (exit {}): {}",
            invocation
                .response_code
                .map_or_else(|| "?".to_string(), |c| c.to_string()),
            invocation.standard_error_content.trim()
        )),
    })
}

#[async_trait]
impl RemoteExecutor for AwsCli {
    async fn open_session(&self, host: &str) -> Result<Box<dyn RemoteSession>> {
        let filter = format!("Key=InstanceIds,Values={host}");
        let cmd = self.ssm_command(&[
            "describe-instance-information",
            "--filters",
            &filter,
            "--output",
            "json",
        ]);
        let stdout = self
            .output(cmd, &format!("ssm describe-instance-information {host}"))
            .await?;
        ensure_online(&stdout, host)?;

        debug!(instance_id = %host, "SSM session opened");
        Ok(Box::new(SsmSession {
            cli: self.clone(),
            instance_id: host.to_string(),
        }))
    }
}

/// Commands against one managed instance
pub struct SsmSession {
    cli: AwsCli,
    instance_id: String,
}

impl SsmSession {
    async fn send(&self, script: &str) -> Result<String> {
        let parameters = run_shell_parameters(script);
        let cmd = self.cli.ssm_command(&[
            "send-command",
            "--instance-ids",
            &self.instance_id,
            "--document-name",
            RUN_SHELL_DOCUMENT,
            "--parameters",
            &parameters,
            "--output",
            "json",
        ]);
        let response: SendCommandResponse = self
            .cli
            .output_json(cmd, &format!("ssm send-command {}", self.instance_id))
            .await?;
        Ok(response.command.command_id)
    }

    async fn poll(&self, command_id: &str) -> Result<String> {
        loop {
            tokio::time::sleep(self.cli.poll_interval).await;

            let cmd = self.cli.ssm_command(&[
                "get-command-invocation",
                "--command-id",
                command_id,
                "--instance-id",
                &self.instance_id,
                "--output",
                "json",
            ]);
            let stdout = match self
                .cli
                .output(cmd, &format!("ssm get-command-invocation {command_id}"))
                .await
            {
                Ok(stdout) => stdout,
                // Briefly unknown right after send-command
                Err(e) if format!("{e:#}").contains("InvocationDoesNotExist") => continue,
                Err(e) => return Err(e),
            };

            match invocation_state(&stdout)? {
                InvocationState::Running => continue,
                InvocationState::Succeeded(output) => return Ok(output),
                InvocationState::Failed(reason) => {
                    bail!("Command {command_id} on {}: {reason}", self.instance_id)
                }
            }
        }
    }
}

#[async_trait]
impl RemoteSession for SsmSession {
    fn host(&self) -> &str {
        &self.instance_id
    }

    async fn run(&self, command: &str, user: Option<&str>) -> Result<String> {
        let script = as_user(command, user);
        let command_id = self.send(&script).await?;
        debug!(instance_id = %self.instance_id, command_id = %command_id, "Remote command sent");

        tokio::time::timeout(self.cli.command_timeout, self.poll(&command_id))
            .await
            .map_err(|_| {
                anyhow!(
                    "Command {command_id} on {} did not finish within {:?}",
                    self.instance_id,
                    self.cli.command_timeout
                )
            })?
    }

    async fn close(&self) -> Result<()> {
        debug!(instance_id = %self.instance_id, "SSM session closed");
        Ok(())
    }
}

impl AwsCli {
    /// SSH `ProxyCommand` that tunnels through an SSM session. `%h` and `%p`
    /// are filled in by the SSH client.
    pub fn ssh_proxy_command(&self) -> String {
        let cmd = self.ssm_command(&[
            "start-session",
            "--target",
            "%h",
            "--document-name",
            SSH_DOCUMENT,
            "--parameters",
            "portNumber=%p",
        ]);
        let cmd = cmd.as_std();
        std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|part| shell_quote(&part.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl TunnelBroker for AwsCli {
    async fn start_session(&self, host: &str, port: u16, sessions: &BackgroundTasks) -> Result<()> {
        let parameters = port_forward_parameters(port);
        let mut cmd = self.ssm_command(&[
            "start-session",
            "--target",
            host,
            "--document-name",
            PORT_FORWARD_DOCUMENT,
            "--parameters",
            &parameters,
        ]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start forwarding session to {host}:{port}"))?;

        info!(host = %host, port, pid = ?child.id(), "Port forwarding session started");

        let host = host.to_string();
        sessions.spawn(format!("tunnel:{host}:{port}"), async move {
            match child.wait().await {
                Ok(status) => warn!(host = %host, port, status = %status, "Port forwarding session ended"),
                Err(e) => warn!(host = %host, port, error = %e, "Lost track of port forwarding session"),
            }
        });

        Ok(())
    }
}
