//! Port forwarding sessions
//!
//! Starts one forwarding session per port, then waits a fixed stabilization
//! interval: the broker gives no readiness signal. Start failures are logged
//! and reported but never fail the call.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::error::ProvisioningError;
use super::tasks::BackgroundTasks;
use crate::job::TunnelSpec;

/// Default wait after issuing all session starts
pub const DEFAULT_STABILIZATION: Duration = Duration::from_secs(30);

/// Starts detached forwarding sessions
#[async_trait]
pub trait TunnelBroker: Send + Sync {
    /// Start forwarding `port` on localhost to `port` on `host`.
    ///
    /// Returns once the session is launched. Anything that watches the
    /// session goes into `sessions`.
    async fn start_session(&self, host: &str, port: u16, sessions: &BackgroundTasks) -> Result<()>;
}

/// Per-port start outcome
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelReport {
    pub started: Vec<u16>,
    pub failed: Vec<TunnelFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelFailure {
    pub port: u16,
    pub reason: String,
}

impl TunnelReport {
    pub fn errors(&self) -> impl Iterator<Item = ProvisioningError> + '_ {
        self.failed.iter().map(|f| ProvisioningError::TunnelStart {
            port: f.port,
            reason: f.reason.clone(),
        })
    }
}

pub struct TunnelSessionManager {
    broker: Arc<dyn TunnelBroker>,
    stabilization: Duration,
}

impl TunnelSessionManager {
    pub fn new(broker: Arc<dyn TunnelBroker>, stabilization: Duration) -> Self {
        Self {
            broker,
            stabilization,
        }
    }

    /// Open every port in `spec` and wait for the sessions to settle.
    pub async fn open(&self, spec: &TunnelSpec, sessions: &BackgroundTasks) -> TunnelReport {
        info!(
            host = %spec.target_host,
            ports = ?spec.ports,
            "Starting port forwarding sessions"
        );

        let starts = spec.ports.iter().map(|&port| async move {
            let result = self
                .broker
                .start_session(&spec.target_host, port, sessions)
                .await;
            (port, result)
        });

        let mut report = TunnelReport::default();
        for (port, result) in join_all(starts).await {
            match result {
                Ok(()) => report.started.push(port),
                Err(e) => {
                    let reason = format!("{e:#}");
                    warn!(host = %spec.target_host, port, error = %reason, "Tunnel session failed to start");
                    report.failed.push(TunnelFailure { port, reason });
                }
            }
        }

        info!(
            seconds = self.stabilization.as_secs_f64(),
            started = report.started.len(),
            failed = report.failed.len(),
            "Waiting for tunnel sessions to stabilize"
        );
        tokio::time::sleep(self.stabilization).await;

        report
    }
}
