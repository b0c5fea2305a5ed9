//! Run a bundled demo job on a development machine
//!
//! ## Usage
//!
//! ```bash
//! # List demo jobs
//! run-job-locally --list
//!
//! # Validate a demo and print the resolved job
//! run-job-locally k8s --dry-run
//!
//! # Run it against real AWS credentials
//! AWS_REGION=us-gov-west-1 run-job-locally winrm
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use scan_runner::demos;
use scan_runner::telemetry::{init_tracing, LogFormat};
use scan_runner::{Runner, RunnerConfig};

/// Run one of the bundled sample scan jobs
#[derive(Parser, Debug)]
#[command(name = "run-job-locally", version, about)]
struct Args {
    /// Demo job name
    #[arg(required_unless_present = "list")]
    demo: Option<String>,

    /// List demo jobs and exit
    #[arg(long)]
    list: bool,

    /// Validate and print the job without running it
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(flatten)]
    config: RunnerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(LogFormat::Text, args.verbose)?;

    if args.list {
        for name in demos::names() {
            println!("{name}");
        }
        return Ok(());
    }

    let Some(name) = args.demo else {
        bail!("a demo name is required");
    };
    let json = demos::find(&name).with_context(|| {
        format!(
            "Unknown demo {name:?}; available: {}",
            demos::names().collect::<Vec<_>>().join(", ")
        )
    })?;

    let runner = Runner::new(args.config).context("Invalid runner configuration")?;
    let job = runner.parse_job(json)?;

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    info!(demo = %name, results_name = %job.results_name, "Running demo job");
    let result = runner.run(job).await?;
    if let Some(key) = &result.key {
        info!(
            algorithm = %key.algorithm,
            fingerprint = %key.fingerprint,
            private_key = %key.private_key_path.display(),
            public_key = %key.public_key_path.display(),
            "Ephemeral key used for this run"
        );
    }
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
