//! Scan process interface
//!
//! The compliance-scan engine is an external process. The pipeline hands it
//! a fully resolved command line and environment and reads back an exit
//! status plus the JSON report written to `report_path`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::publisher::report_file_name;
use super::sandbox::Sandbox;
use super::ssh_key::remote::shell_quote;

/// Colon separated private key paths, exported to the scan process so its
/// command can pass them on (e.g. `-i "$SCAN_KEY_FILES"`).
pub const KEY_FILES_VAR: &str = "SCAN_KEY_FILES";

/// Everything the scan process needs
#[derive(Debug, Clone)]
pub struct ScanInvocation {
    pub command_line: String,
    pub report_path: PathBuf,
    pub env: Vec<(String, String)>,
    /// Private keys provisioned for this run
    pub key_files: Vec<PathBuf>,
}

impl ScanInvocation {
    /// Environment for the child process, with `KEY_FILES_VAR` added when
    /// keys were provisioned. An inherited binding of that name is a
    /// conflict, not something to overwrite.
    pub fn child_env(&self) -> Result<Vec<(String, String)>> {
        let mut env = self.env.clone();
        if self.key_files.is_empty() {
            return Ok(env);
        }
        if env.iter().any(|(name, _)| name == KEY_FILES_VAR) {
            bail!("{KEY_FILES_VAR} is already set in the scan environment");
        }
        let paths: Vec<String> = self
            .key_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        env.push((KEY_FILES_VAR.to_string(), paths.join(":")));
        Ok(env)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    /// Non-zero exit code
    Failed { code: i32 },
    /// Terminated by a signal, or never ran
    Abnormal,
}

impl ExitStatus {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitStatus::Success,
            Some(code) => ExitStatus::Failed { code },
            None => ExitStatus::Abnormal,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }
}

#[async_trait]
pub trait ScanProcess: Send + Sync {
    async fn run(&self, invocation: &ScanInvocation) -> Result<ExitStatus>;
}

/// Append the reporter arguments so the engine writes JSON to `report_path`
/// while still printing to stdout. The report argument is quoted as one
/// shell word.
pub fn scan_command_line(command: &str, report_path: &Path) -> String {
    let reporter = format!("json:{}", report_path.display());
    format!(
        "{} --reporter cli {}",
        command.trim_end(),
        shell_quote(&reporter)
    )
}

/// Add `--proxy-command` for `ssh://user@<instance-id>` targets so the SSH
/// connection rides an SSM session. Commands that already name a proxy are
/// left alone.
pub fn with_ssh_proxy(command: &str, proxy_command: &str) -> String {
    if command.contains("--proxy-command") || !targets_managed_instance(command) {
        return command.to_string();
    }
    format!(
        "{} --proxy-command {}",
        command.trim_end(),
        shell_quote(proxy_command)
    )
}

fn targets_managed_instance(command: &str) -> bool {
    Regex::new(r"ssh://\S+@m?i-[a-z0-9]{17}\b")
        .map(|re| re.is_match(command))
        .unwrap_or(false)
}

pub fn report_path(sandbox: &Sandbox, results_name: &str, at: chrono::DateTime<chrono::Utc>) -> PathBuf {
    sandbox.root().join(report_file_name(results_name, at))
}
