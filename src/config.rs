//! Runner configuration
//!
//! Flags with environment fallbacks, shared by both binaries.

use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

use crate::job::JobDefaults;
use crate::pipeline::publisher::{DEFAULT_EVAL_TAG, DEFAULT_RESULTS_PREFIX};
use crate::pipeline::sandbox::{Sandbox, DEFAULT_SANDBOX_ROOT};
use crate::pipeline::PipelineSettings;
use crate::tools::aws::{AwsCli, DEFAULT_AWS_CLI};

pub const DEFAULT_KEY_TTL_SECS: i64 = 600;
pub const DEFAULT_TUNNEL_STABILIZATION_SECS: u64 = 30;
pub const DEFAULT_REMOTE_COMMAND_TIMEOUT_SECS: u64 = 120;

#[derive(Args, Debug, Clone)]
pub struct RunnerConfig {
    /// Writable root for downloaded resources, keys and reports
    #[arg(long, env = "SCAN_SANDBOX_ROOT", default_value = DEFAULT_SANDBOX_ROOT)]
    pub sandbox_root: PathBuf,

    /// Seconds to wait after starting port forwarding sessions
    #[arg(long, env = "TUNNEL_STABILIZATION_SECS", default_value_t = DEFAULT_TUNNEL_STABILIZATION_SECS)]
    pub tunnel_stabilization_secs: u64,

    /// Lifetime of ephemeral SSH keys when the job does not set one
    #[arg(
        long,
        env = "EPHEMERAL_KEY_TTL_SECS",
        default_value_t = DEFAULT_KEY_TTL_SECS,
        allow_negative_numbers = true
    )]
    pub key_ttl_secs: i64,

    /// Envelope tags for sinks without their own
    #[arg(long, env = "DEFAULT_EVAL_TAG", default_value = DEFAULT_EVAL_TAG)]
    pub default_eval_tag: String,

    /// Object key prefix for published reports
    #[arg(long, env = "RESULTS_PREFIX", default_value = DEFAULT_RESULTS_PREFIX)]
    pub results_prefix: String,

    /// SSM VPC endpoint (DNS entry or hostname containing `vpce`)
    #[arg(long, env = "SSM_ENDPOINT")]
    pub ssm_endpoint: Option<String>,

    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// AWS CLI program
    #[arg(long, env = "AWS_CLI", default_value = DEFAULT_AWS_CLI)]
    pub aws_cli: String,

    /// Upper bound on one remote command, including polling
    #[arg(long, env = "REMOTE_COMMAND_TIMEOUT_SECS", default_value_t = DEFAULT_REMOTE_COMMAND_TIMEOUT_SECS)]
    pub remote_command_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from(DEFAULT_SANDBOX_ROOT),
            tunnel_stabilization_secs: DEFAULT_TUNNEL_STABILIZATION_SECS,
            key_ttl_secs: DEFAULT_KEY_TTL_SECS,
            default_eval_tag: DEFAULT_EVAL_TAG.to_string(),
            results_prefix: DEFAULT_RESULTS_PREFIX.to_string(),
            ssm_endpoint: None,
            region: None,
            aws_cli: DEFAULT_AWS_CLI.to_string(),
            remote_command_timeout_secs: DEFAULT_REMOTE_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl RunnerConfig {
    pub fn sandbox(&self) -> Sandbox {
        Sandbox::new(&self.sandbox_root)
    }

    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            key_ttl_seconds: self.key_ttl_secs,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            tunnel_stabilization: Duration::from_secs(self.tunnel_stabilization_secs),
            default_eval_tags: self.default_eval_tag.clone(),
            results_prefix: self.results_prefix.clone(),
            ssh_proxy_command: None,
        }
    }

    pub fn aws(&self) -> Result<AwsCli> {
        AwsCli::new(&self.aws_cli)
            .with_region(self.region.clone())
            .with_command_timeout(Duration::from_secs(self.remote_command_timeout_secs))
            .with_ssm_endpoint(self.ssm_endpoint.as_deref())
    }
}
