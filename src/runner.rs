//! Production wiring
//!
//! Builds the pipeline from a `RunnerConfig` with the AWS CLI and shell
//! collaborators, runs one job, and waits for key removal before returning.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::RunnerConfig;
use crate::job::{ExecutionJob, JobDescription};
use crate::pipeline::ssh_key::Ed25519KeyGenerator;
use crate::pipeline::{
    Collaborators, EnvStore, PipelineContext, PipelineCoordinator, PipelineFailure,
    PipelineResult, PipelineSettings, ProcessEnv, ProvisioningError,
};
use crate::tools::aws::AwsCli;
use crate::tools::scan::ShellScanProcess;

pub struct Runner {
    config: RunnerConfig,
    settings: PipelineSettings,
    collaborators: Collaborators,
    env: Arc<dyn EnvStore>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let aws = Arc::new(config.aws()?);
        let proxy = aws.ssh_proxy_command();
        let mut runner = Self::with_collaborators(
            config,
            Self::aws_collaborators(aws),
            Arc::new(ProcessEnv),
        );
        runner.settings.ssh_proxy_command = Some(proxy);
        Ok(runner)
    }

    pub fn with_collaborators(
        config: RunnerConfig,
        collaborators: Collaborators,
        env: Arc<dyn EnvStore>,
    ) -> Self {
        Self {
            settings: config.pipeline_settings(),
            config,
            collaborators,
            env,
        }
    }

    fn aws_collaborators(aws: Arc<AwsCli>) -> Collaborators {
        Collaborators {
            sources: aws.clone(),
            key_generator: Arc::new(Ed25519KeyGenerator),
            remote: aws.clone(),
            tunnels: aws.clone(),
            scan: Arc::new(ShellScanProcess::default()),
            sink: aws,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Parse and validate a job description.
    pub fn parse_job(&self, json: &str) -> Result<ExecutionJob, ProvisioningError> {
        JobDescription::from_json(json)?.validate(&self.config.job_defaults())
    }

    /// Run one job to completion.
    ///
    /// Returns after pending key removals have run, so a successful return
    /// means no ephemeral key is left installed.
    pub async fn run(&self, job: ExecutionJob) -> Result<PipelineResult, PipelineFailure> {
        let context = PipelineContext::new(self.env.clone(), self.config.sandbox());
        let mut coordinator = PipelineCoordinator::new(
            job,
            context.clone(),
            self.collaborators.clone(),
            self.settings.clone(),
        );

        let outcome = coordinator.run().await;

        if !context.cleanup.is_empty() {
            info!(
                pending = context.cleanup.len(),
                "Waiting for ephemeral key removal"
            );
        }
        context.cleanup.wait().await;

        outcome
    }
}
