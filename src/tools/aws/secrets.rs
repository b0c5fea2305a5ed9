//! Secrets Manager reads

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::Deserialize;

use super::AwsCli;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SecretValue {
    secret_string: Option<String>,
    /// Base64 in CLI output
    secret_binary: Option<String>,
}

pub async fn get_secret(cli: &AwsCli, secret_id: &str) -> Result<Vec<u8>> {
    let cmd = cli.command(&[
        "secretsmanager",
        "get-secret-value",
        "--secret-id",
        secret_id,
        "--output",
        "json",
    ]);
    let stdout = cli
        .output(cmd, &format!("secretsmanager get-secret-value {secret_id}"))
        .await?;
    parse_secret_value(&stdout).with_context(|| format!("Secret {secret_id}"))
}

fn parse_secret_value(stdout: &[u8]) -> Result<Vec<u8>> {
    let value: SecretValue =
        serde_json::from_slice(stdout).context("Unexpected get-secret-value response")?;

    match (value.secret_string, value.secret_binary) {
        (Some(s), _) => Ok(s.into_bytes()),
        (None, Some(b)) => base64::engine::general_purpose::STANDARD
            .decode(b.trim())
            .context("SecretBinary is not valid base64"),
        (None, None) => bail!("response has neither SecretString nor SecretBinary"),
    }
}
