//! Scan engine launched through `sh -c`

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

use crate::pipeline::scan::{ExitStatus, ScanInvocation, ScanProcess};

/// Runs the scan command line with the pipeline's environment.
///
/// Output is inherited so the engine's CLI reporter reaches the invocation
/// log directly.
#[derive(Debug, Clone)]
pub struct ShellScanProcess {
    shell: String,
}

impl Default for ShellScanProcess {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellScanProcess {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl ScanProcess for ShellScanProcess {
    async fn run(&self, invocation: &ScanInvocation) -> Result<ExitStatus> {
        let env = invocation.child_env()?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&invocation.command_line)
            .env_clear()
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if let Some(dir) = invocation.report_path.parent() {
            cmd.current_dir(dir);
        }

        debug!(
            shell = %self.shell,
            env_vars = env.len(),
            key_files = invocation.key_files.len(),
            "Spawning scan process"
        );

        let status = cmd
            .status()
            .await
            .with_context(|| format!("Failed to spawn {}", self.shell))?;

        let exit = ExitStatus::from_code(status.code());
        info!(status = %status, "Scan process exited");
        Ok(exit)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::pipeline::scan::{report_path, scan_command_line, KEY_FILES_VAR};
    use crate::pipeline::Sandbox;
    use std::path::PathBuf;

    fn invocation(command_line: &str, report_path: PathBuf) -> ScanInvocation {
        ScanInvocation {
            command_line: command_line.into(),
            report_path,
            env: vec![
                ("PATH".into(), std::env::var("PATH").unwrap_or_default()),
                ("WIN_PASS".into(), "hunter2".into()),
            ],
            key_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_environment_is_passed_and_status_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.json");
        let line = format!(
            r#"printf '{{"pass": "%s"}}' "$WIN_PASS" > {}; exit 100"#,
            report.display()
        );

        let status = ShellScanProcess::default()
            .run(&invocation(&line, report.clone()))
            .await
            .unwrap();

        assert_eq!(status, ExitStatus::Failed { code: 100 });
        assert_eq!(std::fs::read_to_string(report).unwrap(), r#"{"pass": "hunter2"}"#);
    }

    #[tokio::test]
    async fn test_missing_shell_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ShellScanProcess::new("/nonexistent/shell")
            .run(&invocation("true", dir.path().join("r.json")))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_child_sees_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.json");
        let key = dir.path().join("tmp_ssh_key");
        let line = format!(r#"printf '%s' "${KEY_FILES_VAR}" > {}"#, report.display());

        let mut invocation = invocation(&line, report.clone());
        invocation.key_files = vec![key.clone()];
        let status = ShellScanProcess::default().run(&invocation).await.unwrap();

        assert!(status.success());
        assert_eq!(std::fs::read_to_string(report).unwrap(), key.display().to_string());
    }

    #[tokio::test]
    async fn test_report_lands_at_path_with_spaces() {
        let dir = tempfile::tempdir().unwrap();
        let at = chrono::Utc::now();
        let report = report_path(&Sandbox::new(dir.path()), "nightly scan; rm -rf x", at);
        // Stands in for the engine: writes its JSON to the `json:` reporter target
        let engine = r#"engine() { printf '{"ok": true}' > "${3#json:}"; }; engine"#;

        let status = ShellScanProcess::default()
            .run(&invocation(&scan_command_line(engine, &report), report.clone()))
            .await
            .unwrap();

        assert!(status.success());
        assert_eq!(std::fs::read_to_string(&report).unwrap(), r#"{"ok": true}"#);
    }
}
