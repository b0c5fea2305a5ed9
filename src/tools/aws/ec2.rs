//! EC2 Windows password data

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::io::Write;

use super::AwsCli;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PasswordData {
    #[serde(default)]
    password_data: String,
}

/// Decrypt the administrator password of `instance_id`.
///
/// The CLI only reads the launch key from a file, so it is written to a
/// private temporary file that is removed when the call returns.
pub async fn get_password_data(cli: &AwsCli, instance_id: &str, launch_key: &[u8]) -> Result<Vec<u8>> {
    let mut key_file = tempfile::NamedTempFile::new().context("Failed to create launch key file")?;
    key_file
        .write_all(launch_key)
        .and_then(|_| key_file.flush())
        .context("Failed to write launch key file")?;
    let key_path = key_file.path().display().to_string();

    let cmd = cli.command(&[
        "ec2",
        "get-password-data",
        "--instance-id",
        instance_id,
        "--priv-launch-key",
        &key_path,
        "--output",
        "json",
    ]);
    let stdout = cli
        .output(cmd, &format!("ec2 get-password-data {instance_id}"))
        .await?;
    drop(key_file);

    parse_password_data(&stdout).with_context(|| format!("Password data of {instance_id}"))
}

fn parse_password_data(stdout: &[u8]) -> Result<Vec<u8>> {
    let response: PasswordData =
        serde_json::from_slice(stdout).context("Unexpected get-password-data response")?;
    let password = response.password_data.trim();
    if password.is_empty() {
        bail!("no password data is available for the instance yet");
    }
    Ok(password.as_bytes().to_vec())
}
