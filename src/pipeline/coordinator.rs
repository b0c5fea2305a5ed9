//! Pipeline coordination
//!
//! Drives one `ExecutionJob` through a forward-only state machine:
//!
//! ```text
//! INIT -> ENV_APPLIED -> RESOURCES_RESOLVED -> [KEY_PROVISIONED] -> [TUNNELS_OPEN]
//!      -> EXECUTING -> COMPLETED | FAILED
//! ```
//!
//! Fatal errors move straight to FAILED with no rollback; whatever was
//! already applied or fetched stays in place for diagnosis. Scan and publish
//! failures are recorded as diagnostics and the run still completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::environment::{EnvStore, EnvironmentConfigurator};
use super::error::{ErrorKind, ProvisioningError};
use super::publisher::{PublishResult, ResultPublisher, ResultSink, DEFAULT_EVAL_TAG, DEFAULT_RESULTS_PREFIX};
use super::resolver::{ResourceResolver, ResourceSourceClient};
use super::sandbox::Sandbox;
use super::scan::{
    report_path, scan_command_line, with_ssh_proxy, ExitStatus, ScanInvocation, ScanProcess,
};
use super::ssh_key::{EphemeralKeyManager, KeyGenerator, KeyPairArtifact, RemoteExecutor};
use super::tasks::BackgroundTasks;
use super::tunnel::{TunnelBroker, TunnelReport, TunnelSessionManager, DEFAULT_STABILIZATION};
use crate::job::ExecutionJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Init,
    EnvApplied,
    ResourcesResolved,
    KeyProvisioned,
    TunnelsOpen,
    Executing,
    Completed,
    Failed,
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineStage::Init => "INIT",
            PipelineStage::EnvApplied => "ENV_APPLIED",
            PipelineStage::ResourcesResolved => "RESOURCES_RESOLVED",
            PipelineStage::KeyProvisioned => "KEY_PROVISIONED",
            PipelineStage::TunnelsOpen => "TUNNELS_OPEN",
            PipelineStage::Executing => "EXECUTING",
            PipelineStage::Completed => "COMPLETED",
            PipelineStage::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// External collaborators the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub sources: Arc<dyn ResourceSourceClient>,
    pub key_generator: Arc<dyn KeyGenerator>,
    pub remote: Arc<dyn RemoteExecutor>,
    pub tunnels: Arc<dyn TunnelBroker>,
    pub scan: Arc<dyn ScanProcess>,
    pub sink: Arc<dyn ResultSink>,
}

/// Shared state for one invocation
#[derive(Clone)]
pub struct PipelineContext {
    pub env: Arc<dyn EnvStore>,
    pub sandbox: Sandbox,
    /// Key removal tasks; the binary waits for these before exiting
    pub cleanup: BackgroundTasks,
    /// Tunnel session watchers; never awaited
    pub sessions: BackgroundTasks,
}

impl PipelineContext {
    pub fn new(env: Arc<dyn EnvStore>, sandbox: Sandbox) -> Self {
        Self {
            env,
            sandbox,
            cleanup: BackgroundTasks::new("cleanup"),
            sessions: BackgroundTasks::new("sessions"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub tunnel_stabilization: Duration,
    pub default_eval_tags: String,
    pub results_prefix: String,
    /// Proxy for `ssh://user@<instance-id>` targets
    pub ssh_proxy_command: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            tunnel_stabilization: DEFAULT_STABILIZATION,
            default_eval_tags: DEFAULT_EVAL_TAG.to_string(),
            results_prefix: DEFAULT_RESULTS_PREFIX.to_string(),
            ssh_proxy_command: None,
        }
    }
}

/// A non-fatal error recorded during the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage: PipelineStage,
    pub kind: ErrorKind,
    pub message: String,
}

impl Diagnostic {
    fn new(stage: PipelineStage, error: &ProvisioningError) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub stage: PipelineStage,
    pub stages: Vec<PipelineStage>,
    pub report_path: PathBuf,
    pub exit_status: ExitStatus,
    pub published: PublishResult,
    pub key: Option<KeyPairArtifact>,
    pub tunnels: Option<TunnelReport>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Error)]
#[error("Pipeline failed after {stage}")]
pub struct PipelineFailure {
    /// Last stage reached before the failure
    pub stage: PipelineStage,
    pub stages: Vec<PipelineStage>,
    #[source]
    pub error: ProvisioningError,
}

pub struct PipelineCoordinator {
    job: ExecutionJob,
    context: PipelineContext,
    collaborators: Collaborators,
    settings: PipelineSettings,
    stage: PipelineStage,
    history: Vec<PipelineStage>,
    run_id: Uuid,
    invoked_at: DateTime<Utc>,
}

impl PipelineCoordinator {
    pub fn new(
        job: ExecutionJob,
        context: PipelineContext,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            job,
            context,
            collaborators,
            settings,
            stage: PipelineStage::Init,
            history: vec![PipelineStage::Init],
            run_id: Uuid::new_v4(),
            invoked_at: Utc::now(),
        }
    }

    /// Pin the invocation time used for report and object names.
    pub fn invoked_at(mut self, at: DateTime<Utc>) -> Self {
        self.invoked_at = at;
        self
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn history(&self) -> &[PipelineStage] {
        &self.history
    }

    pub fn job(&self) -> &ExecutionJob {
        &self.job
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Run the job to a terminal stage.
    pub async fn run(&mut self) -> Result<PipelineResult, PipelineFailure> {
        let span = tracing::info_span!(
            "pipeline",
            run_id = %self.run_id,
            results_name = %self.job.results_name
        );

        async move {
            if self.stage != PipelineStage::Init {
                return Err(PipelineFailure {
                    stage: self.stage,
                    stages: self.history.clone(),
                    error: ProvisioningError::config("pipeline has already run"),
                });
            }

            match self.execute().await {
                Ok(result) => Ok(result),
                Err(error) => {
                    let stage = self.stage;
                    error!(stage = %stage, kind = %error.kind(), error = %error, "Pipeline failed");
                    self.advance(PipelineStage::Failed);
                    Err(PipelineFailure {
                        stage,
                        stages: self.history.clone(),
                        error,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> Result<PipelineResult, ProvisioningError> {
        let mut diagnostics = Vec::new();

        EnvironmentConfigurator::new(self.context.env.as_ref()).apply(&self.job.env_overrides)?;
        self.advance(PipelineStage::EnvApplied);

        self.resolve_resources().await?;
        self.advance(PipelineStage::ResourcesResolved);

        let key = match self.job.key_request.clone() {
            Some(request) => {
                let manager = EphemeralKeyManager::new(
                    self.collaborators.key_generator.clone(),
                    self.collaborators.remote.clone(),
                    self.context.sandbox.clone(),
                );
                let artifact = manager.provision(&request, &self.context.cleanup).await?;
                self.job.credentials.push(artifact.private_key_path.clone());
                self.advance(PipelineStage::KeyProvisioned);
                Some(artifact)
            }
            None => None,
        };

        let tunnels = match self.job.tunnel_spec.clone() {
            Some(spec) => {
                let manager = TunnelSessionManager::new(
                    self.collaborators.tunnels.clone(),
                    self.settings.tunnel_stabilization,
                );
                let report = manager.open(&spec, &self.context.sessions).await;
                diagnostics.extend(
                    report
                        .errors()
                        .map(|e| Diagnostic::new(PipelineStage::TunnelsOpen, &e)),
                );
                self.advance(PipelineStage::TunnelsOpen);
                Some(report)
            }
            None => None,
        };

        self.advance(PipelineStage::Executing);
        let (report_path, exit_status) = self.execute_scan(&mut diagnostics).await;

        let publisher = ResultPublisher::new(self.collaborators.sink.clone())
            .with_default_tags(self.settings.default_eval_tags.clone())
            .with_prefix(self.settings.results_prefix.clone());
        let published = publisher
            .publish(
                &report_path,
                &self.job.result_sinks,
                &self.job.results_name,
                self.invoked_at,
            )
            .await;
        diagnostics.extend(
            published
                .errors()
                .map(|e| Diagnostic::new(PipelineStage::Executing, &e)),
        );

        self.advance(PipelineStage::Completed);

        info!(
            exit_status = ?exit_status,
            published = published.published().count(),
            diagnostics = diagnostics.len(),
            "Pipeline completed"
        );

        Ok(PipelineResult {
            run_id: self.run_id,
            stage: self.stage,
            stages: self.history.clone(),
            report_path,
            exit_status,
            published,
            key,
            tunnels,
            diagnostics,
        })
    }

    async fn resolve_resources(&mut self) -> Result<(), ProvisioningError> {
        let resolver = ResourceResolver::new(
            self.collaborators.sources.as_ref(),
            self.context.env.as_ref(),
            &self.context.sandbox,
        );

        for descriptor in &self.job.resources {
            let resolved = resolver.resolve(descriptor).await?;
            self.job.resolved.push(resolved);
        }

        info!(count = self.job.resolved.len(), "Resources resolved");
        Ok(())
    }

    async fn execute_scan(&self, diagnostics: &mut Vec<Diagnostic>) -> (PathBuf, ExitStatus) {
        let report_path = report_path(&self.context.sandbox, &self.job.results_name, self.invoked_at);
        let command = match &self.settings.ssh_proxy_command {
            Some(proxy) => with_ssh_proxy(&self.job.scan_command, proxy),
            None => self.job.scan_command.clone(),
        };
        let invocation = ScanInvocation {
            command_line: scan_command_line(&command, &report_path),
            report_path: report_path.clone(),
            env: self.context.env.vars(),
            key_files: self.job.credentials.clone(),
        };

        info!(
            command = %invocation.command_line,
            report = %report_path.display(),
            "Running scan"
        );

        let exit_status = match self.collaborators.scan.run(&invocation).await {
            Ok(status) => {
                if !status.success() {
                    let err = ProvisioningError::ScanProcess(format!("scan exited with {status:?}"));
                    warn!(error = %err, "Scan did not succeed, publishing whatever it produced");
                    diagnostics.push(Diagnostic::new(PipelineStage::Executing, &err));
                }
                status
            }
            Err(e) => {
                let err = ProvisioningError::ScanProcess(format!("{e:#}"));
                warn!(error = %err, "Scan process could not be run");
                diagnostics.push(Diagnostic::new(PipelineStage::Executing, &err));
                ExitStatus::Abnormal
            }
        };

        (report_path, exit_status)
    }

    fn advance(&mut self, next: PipelineStage) {
        debug_assert!(next > self.stage, "stage transitions are forward-only");
        debug!(from = %self.stage, to = %next, "Stage transition");
        self.stage = next;
        self.history.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{
        EphemeralKeyRequest, ResolvedResource, ResourceDescriptor, ResourceDestination,
        ResourceSource, SinkSpec, TunnelSpec,
    };
    use crate::pipeline::environment::MemoryEnv;
    use crate::pipeline::publisher::Envelope;
    use crate::pipeline::scan::KEY_FILES_VAR;
    use crate::pipeline::ssh_key::Ed25519KeyGenerator;
    use crate::pipeline::testing::{FakeBroker, FakeRemote, FakeScan, FakeSink, FakeSources};
    use chrono::TimeZone;
    use indexmap::IndexMap;

    struct Harness {
        _dir: tempfile::TempDir,
        sandbox: Sandbox,
        env: Arc<MemoryEnv>,
        sources: Arc<FakeSources>,
        remote: Arc<FakeRemote>,
        broker: Arc<FakeBroker>,
        scan: Arc<FakeScan>,
        sink: Arc<FakeSink>,
    }

    impl Harness {
        fn new(sources: FakeSources, scan: FakeScan, sink: FakeSink) -> Self {
            let dir = tempfile::tempdir().unwrap();
            Self {
                sandbox: Sandbox::new(dir.path()),
                _dir: dir,
                env: Arc::new(MemoryEnv::new()),
                sources: Arc::new(sources),
                remote: Arc::new(FakeRemote::new("/home/ssm-user")),
                broker: Arc::new(FakeBroker::new().failing_port(5986)),
                scan: Arc::new(scan),
                sink: Arc::new(sink),
            }
        }

        fn coordinator(&self, job: ExecutionJob) -> PipelineCoordinator {
            self.coordinator_with(
                job,
                PipelineSettings {
                    tunnel_stabilization: Duration::from_secs(30),
                    ..Default::default()
                },
            )
        }

        fn coordinator_with(&self, job: ExecutionJob, settings: PipelineSettings) -> PipelineCoordinator {
            let collaborators = Collaborators {
                sources: self.sources.clone(),
                key_generator: Arc::new(Ed25519KeyGenerator),
                remote: self.remote.clone(),
                tunnels: self.broker.clone(),
                scan: self.scan.clone(),
                sink: self.sink.clone(),
            };
            PipelineCoordinator::new(
                job,
                PipelineContext::new(self.env.clone(), self.sandbox.clone()),
                collaborators,
                settings,
            )
            .invoked_at(Utc.with_ymd_and_hms(2024, 1, 31, 13, 5, 9).unwrap())
        }
    }

    fn job() -> ExecutionJob {
        ExecutionJob {
            scan_command: "inspec exec /tmp/profile.tar.gz -t aws://".into(),
            results_name: "aws-cis".into(),
            env_overrides: IndexMap::new(),
            resources: vec![ResourceDescriptor {
                source: ResourceSource::ObjectStore {
                    bucket: "profiles".into(),
                    key: "profile.tar.gz".into(),
                },
                destination: ResourceDestination::File(PathBuf::from("profile.tar.gz")),
            }],
            key_request: None,
            tunnel_spec: None,
            result_sinks: vec![SinkSpec {
                locator: "results".into(),
                tags: None,
            }],
            credentials: Vec::new(),
            resolved: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_completes() {
        let h = Harness::new(
            FakeSources::new().with_object("profiles", "profile.tar.gz", "tarball"),
            FakeScan::exiting(0, r#"{"profiles": [{"name": "cis"}]}"#),
            FakeSink::new(),
        );
        let mut coordinator = h.coordinator(job());

        let result = coordinator.run().await.unwrap();

        assert_eq!(result.stage, PipelineStage::Completed);
        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Init,
                PipelineStage::EnvApplied,
                PipelineStage::ResourcesResolved,
                PipelineStage::Executing,
                PipelineStage::Completed,
            ]
        );
        assert!(result.exit_status.success());
        assert!(result.diagnostics.is_empty());
        assert_eq!(
            coordinator.job().resolved,
            vec![ResolvedResource::File(h.sandbox.root().join("profile.tar.gz"))]
        );

        let puts = h.sink.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].key, "unprocessed/2024-01-31_13-05-09_aws-cis.json");
        let envelope: Envelope = serde_json::from_slice(&puts[0].body).unwrap();
        assert_eq!(envelope.eval_tags, DEFAULT_EVAL_TAG);
        assert_eq!(envelope.data["profiles"][0]["name"], "cis");

        let invocation = &h.scan.invocations()[0];
        assert_eq!(
            invocation.command_line,
            format!(
                "inspec exec /tmp/profile.tar.gz -t aws:// --reporter cli 'json:{}'",
                result.report_path.display()
            )
        );
        assert_eq!(
            result.report_path,
            h.sandbox.root().join("2024-01-31_13-05-09_aws-cis.json")
        );
    }

    #[tokio::test]
    async fn test_resource_failure_prevents_scan() {
        let h = Harness::new(FakeSources::new(), FakeScan::exiting(0, "{}"), FakeSink::new());
        let mut coordinator = h.coordinator(job());

        let failure = coordinator.run().await.unwrap_err();

        assert!(matches!(failure.error, ProvisioningError::ResourceFetch { .. }));
        assert_eq!(failure.stage, PipelineStage::EnvApplied);
        assert_eq!(coordinator.stage(), PipelineStage::Failed);
        assert!(h.scan.invocations().is_empty());
        assert!(h.sink.puts().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_still_publishes() {
        let h = Harness::new(
            FakeSources::new().with_object("profiles", "profile.tar.gz", "tarball"),
            FakeScan::exiting(100, r#"{"statistics": {"failed": 3}}"#),
            FakeSink::new(),
        );
        let mut coordinator = h.coordinator(job());

        let result = coordinator.run().await.unwrap();

        assert_eq!(result.stage, PipelineStage::Completed);
        assert_eq!(result.exit_status, ExitStatus::Failed { code: 100 });
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].kind, ErrorKind::ScanProcess);
        assert_eq!(h.sink.puts().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_spawn_error_still_attempts_publication() {
        let h = Harness::new(
            FakeSources::new().with_object("profiles", "profile.tar.gz", "tarball"),
            FakeScan::erroring("inspec: command not found"),
            FakeSink::new(),
        );
        let mut coordinator = h.coordinator(job());

        let result = coordinator.run().await.unwrap();

        assert_eq!(result.exit_status, ExitStatus::Abnormal);
        let kinds: Vec<_> = result.diagnostics.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![ErrorKind::ScanProcess, ErrorKind::ResultPublish]);
        assert_eq!(result.published.outcomes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_and_tunnel_stages() {
        let h = Harness::new(
            FakeSources::new()
                .with_object("profiles", "profile.tar.gz", "tarball")
                .with_parameter("/inspec/win/password", "secret"),
            FakeScan::exiting(0, "{}"),
            FakeSink::new(),
        );
        let mut job = job();
        job.env_overrides.insert("TARGET".into(), "winrm://localhost".into());
        job.resources.push(ResourceDescriptor {
            source: ResourceSource::ParameterStore {
                name: "/inspec/win/password".into(),
            },
            destination: ResourceDestination::EnvVar("WIN_PASS".into()),
        });
        job.key_request = Some(EphemeralKeyRequest {
            target_host: "i-00f1868f8f3b4eb03".into(),
            remote_user: "ssm-user".into(),
            key_name: "tmp_ssh_key".into(),
            ttl_seconds: 600,
        });
        job.tunnel_spec = Some(TunnelSpec {
            target_host: "i-0e35ab216355084ee".into(),
            ports: [5985, 5986].into_iter().collect(),
        });
        let mut coordinator = h.coordinator(job);

        let result = coordinator.run().await.unwrap();

        assert_eq!(
            result.stages,
            vec![
                PipelineStage::Init,
                PipelineStage::EnvApplied,
                PipelineStage::ResourcesResolved,
                PipelineStage::KeyProvisioned,
                PipelineStage::TunnelsOpen,
                PipelineStage::Executing,
                PipelineStage::Completed,
            ]
        );

        let key_path = h.sandbox.root().join("tmp_ssh_key");
        assert_eq!(coordinator.job().credentials, vec![key_path.clone()]);

        let invocation = &h.scan.invocations()[0];
        assert_eq!(invocation.key_files, vec![key_path]);
        assert!(invocation
            .env
            .contains(&("WIN_PASS".to_string(), "secret".to_string())));
        assert!(invocation
            .env
            .contains(&("TARGET".to_string(), "winrm://localhost".to_string())));

        // 5986 fails to start: reported, not fatal
        let tunnels = result.tunnels.unwrap();
        assert_eq!(tunnels.started, vec![5985]);
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].kind, ErrorKind::TunnelStart);

        // Removal still pending after the pipeline returned
        assert_eq!(coordinator.context().cleanup.len(), 1);
        coordinator.context().cleanup.wait().await;
        assert_eq!(h.remote.sessions_closed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ssh_to_managed_instance_is_proxied() {
        let h = Harness::new(
            FakeSources::new().with_object("profiles", "profile.tar.gz", "tarball"),
            FakeScan::exiting(0, "{}"),
            FakeSink::new(),
        );
        let mut job = job();
        job.scan_command =
            r#"inspec exec profile.tar.gz -t ssh://ssm-user@i-00f1868f8f3b4eb03 -i "$SCAN_KEY_FILES""#.into();
        job.key_request = Some(EphemeralKeyRequest {
            target_host: "i-00f1868f8f3b4eb03".into(),
            remote_user: "ssm-user".into(),
            key_name: "tmp_ssh_key".into(),
            ttl_seconds: 600,
        });
        let settings = PipelineSettings {
            ssh_proxy_command: Some("aws ssm start-session --target %h".into()),
            ..Default::default()
        };
        let mut coordinator = h.coordinator_with(job, settings);

        let result = coordinator.run().await.unwrap();

        let invocation = &h.scan.invocations()[0];
        assert_eq!(
            invocation.command_line,
            format!(
                r#"inspec exec profile.tar.gz -t ssh://ssm-user@i-00f1868f8f3b4eb03 -i "$SCAN_KEY_FILES" --proxy-command 'aws ssm start-session --target %h' --reporter cli 'json:{}'"#,
                result.report_path.display()
            )
        );
        let env = invocation.child_env().unwrap();
        let key_path = h.sandbox.root().join("tmp_ssh_key");
        assert!(env.contains(&(KEY_FILES_VAR.to_string(), key_path.display().to_string())));

        coordinator.context().cleanup.wait().await;
    }

    #[tokio::test]
    async fn test_env_conflict_between_override_and_resource() {
        let h = Harness::new(
            FakeSources::new().with_secret("pw", "x"),
            FakeScan::exiting(0, "{}"),
            FakeSink::new(),
        );
        let mut job = job();
        job.env_overrides.insert("WIN_PASS".into(), "inline".into());
        job.resources = vec![ResourceDescriptor {
            source: ResourceSource::SecretStore { name: "pw".into() },
            destination: ResourceDestination::EnvVar("WIN_PASS".into()),
        }];
        let mut coordinator = h.coordinator(job);

        let failure = coordinator.run().await.unwrap_err();

        assert!(matches!(failure.error, ProvisioningError::EnvConflict { .. }));
        assert!(h.sources.calls().is_empty());
        // Not rolled back
        assert_eq!(h.env.get("WIN_PASS").as_deref(), Some("inline"));
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let h = Harness::new(
            FakeSources::new().with_object("profiles", "profile.tar.gz", "tarball"),
            FakeScan::exiting(0, "{}"),
            FakeSink::new(),
        );
        let mut coordinator = h.coordinator(job());

        coordinator.run().await.unwrap();
        let failure = coordinator.run().await.unwrap_err();

        assert!(matches!(failure.error, ProvisioningError::Configuration(_)));
        assert_eq!(h.scan.invocations().len(), 1);
    }
}
