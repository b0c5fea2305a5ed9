//! Scan Runner
//!
//! Runs one compliance-scan job described in JSON.
//!
//! ## Usage
//!
//! ```bash
//! # Run a job from a file (or `-` for stdin)
//! scan-runner run job.json
//!
//! # Validate without touching AWS
//! scan-runner validate job.json
//!
//! # Route SSM through a VPC endpoint, human-readable logs
//! SSM_ENDPOINT=vpce-0abc.ssm.us-gov-west-1.vpce.amazonaws.com scan-runner --log-format text run job.json
//! ```
//!
//! The result document is printed to stdout; logs go to stderr.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::{error, info};

use scan_runner::telemetry::{init_tracing, LogFormat};
use scan_runner::{Runner, RunnerConfig};

#[derive(Parser, Debug)]
#[command(name = "scan-runner", version, about)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "json", global = true)]
    log_format: LogFormat,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    config: RunnerConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision, scan and publish
    Run {
        /// Job description file, `-` for stdin
        #[arg(default_value = "-")]
        job: PathBuf,
    },

    /// Parse and validate a job description, then print the validated job
    Validate {
        /// Job description file, `-` for stdin
        #[arg(default_value = "-")]
        job: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, cli.verbose)?;

    let runner = Runner::new(cli.config).context("Invalid runner configuration")?;

    match cli.command {
        Commands::Validate { job } => {
            let json = read_job(&job).await?;
            let job = runner.parse_job(&json)?;
            info!(results_name = %job.results_name, "Job description is valid");
            println!("{}", serde_json::to_string_pretty(&job)?);
        }

        Commands::Run { job } => {
            let json = read_job(&job).await?;
            let job = runner.parse_job(&json)?;

            info!(
                results_name = %job.results_name,
                sandbox = %runner.config().sandbox_root.display(),
                "Starting scan job"
            );

            match runner.run(job).await {
                Ok(result) => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Err(failure) => {
                    error!(
                        stage = %failure.stage,
                        kind = %failure.error.kind(),
                        error = %failure.error,
                        "Scan job failed"
                    );
                    let document = serde_json::json!({
                        "stage": "FAILED",
                        "failed_after": failure.stage,
                        "stages": failure.stages,
                        "error": {
                            "kind": failure.error.kind(),
                            "message": failure.error.to_string(),
                        },
                    });
                    println!("{}", serde_json::to_string_pretty(&document)?);
                    return Err(failure.into());
                }
            }
        }
    }

    Ok(())
}

async fn read_job(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut json = String::new();
        tokio::io::stdin()
            .read_to_string(&mut json)
            .await
            .context("Failed to read job description from stdin")?;
        Ok(json)
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read job description {}", path.display()))
    }
}
