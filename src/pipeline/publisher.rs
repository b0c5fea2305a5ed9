//! Result publication
//!
//! Wraps the scan report in an envelope and fans it out to every declared
//! sink. One sink failing never stops the others.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::ProvisioningError;
use crate::job::SinkSpec;

/// Tag applied when neither the sink nor the job supplies one
pub const DEFAULT_EVAL_TAG: &str = "ServerlessInspec";

/// Key prefix for published reports
pub const DEFAULT_RESULTS_PREFIX: &str = "unprocessed";

/// Durable destination for envelopes
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn put(&self, sink: &str, key: &str, body: Vec<u8>) -> Result<()>;
}

/// Report payload plus classification tags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Parsed report, or the raw text when the report is not JSON
    pub data: serde_json::Value,
    pub eval_tags: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SinkStatus {
    Published,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkOutcome {
    pub sink: String,
    pub key: String,
    #[serde(flatten)]
    pub status: SinkStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishResult {
    pub outcomes: Vec<SinkOutcome>,
}

impl PublishResult {
    pub fn published(&self) -> impl Iterator<Item = &SinkOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == SinkStatus::Published)
    }

    pub fn errors(&self) -> impl Iterator<Item = ProvisioningError> + '_ {
        self.outcomes.iter().filter_map(|o| match &o.status {
            SinkStatus::Published => None,
            SinkStatus::Failed { reason } => Some(ProvisioningError::ResultPublish {
                sink: o.sink.clone(),
                reason: reason.clone(),
            }),
        })
    }
}

/// Timestamped report file / object name: `2024-01-31_13-05-09_<name>.json`
pub fn report_file_name(results_name: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.json", at.format("%Y-%m-%d_%H-%M-%S"), results_name)
}

pub struct ResultPublisher {
    sink: Arc<dyn ResultSink>,
    default_tags: String,
    prefix: String,
}

impl ResultPublisher {
    pub fn new(sink: Arc<dyn ResultSink>) -> Self {
        Self {
            sink,
            default_tags: DEFAULT_EVAL_TAG.to_string(),
            prefix: DEFAULT_RESULTS_PREFIX.to_string(),
        }
    }

    pub fn with_default_tags(mut self, tags: impl Into<String>) -> Self {
        self.default_tags = tags.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Object key for a run; `prefix/<file name>`.
    pub fn object_key(&self, results_name: &str, invoked_at: DateTime<Utc>) -> String {
        let file_name = report_file_name(results_name, invoked_at);
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            file_name
        } else {
            format!("{prefix}/{file_name}")
        }
    }

    /// Publish `report_path` to each sink.
    pub async fn publish(
        &self,
        report_path: &Path,
        sinks: &[SinkSpec],
        results_name: &str,
        invoked_at: DateTime<Utc>,
    ) -> PublishResult {
        if sinks.is_empty() {
            info!("No result sinks declared, skipping publication");
            return PublishResult::default();
        }

        let key = self.object_key(results_name, invoked_at);

        let report = match tokio::fs::read_to_string(report_path).await {
            Ok(report) => report,
            Err(e) => {
                let reason = format!("Report {} unavailable: {e}", report_path.display());
                warn!(error = %reason, "Cannot publish results");
                return PublishResult {
                    outcomes: sinks
                        .iter()
                        .map(|s| SinkOutcome {
                            sink: s.locator.clone(),
                            key: key.clone(),
                            status: SinkStatus::Failed {
                                reason: reason.clone(),
                            },
                        })
                        .collect(),
                };
            }
        };

        let data = serde_json::from_str(&report).unwrap_or_else(|_| {
            warn!(path = %report_path.display(), "Report is not JSON, publishing raw text");
            serde_json::Value::String(report)
        });

        let puts = sinks.iter().map(|spec| {
            let envelope = Envelope {
                data: data.clone(),
                eval_tags: spec.tags.clone().unwrap_or_else(|| self.default_tags.clone()),
            };
            let key = key.clone();
            async move {
                let status = match self.put(&spec.locator, &key, &envelope).await {
                    Ok(()) => {
                        info!(sink = %spec.locator, key = %key, tags = %envelope.eval_tags, "Results published");
                        SinkStatus::Published
                    }
                    Err(e) => {
                        let reason = format!("{e:#}");
                        warn!(sink = %spec.locator, key = %key, error = %reason, "Failed to publish results");
                        SinkStatus::Failed { reason }
                    }
                };
                SinkOutcome {
                    sink: spec.locator.clone(),
                    key,
                    status,
                }
            }
        });

        PublishResult {
            outcomes: join_all(puts).await,
        }
    }

    async fn put(&self, sink: &str, key: &str, envelope: &Envelope) -> Result<()> {
        let body = serde_json::to_vec(envelope)?;
        self.sink.put(sink, key, body).await
    }
}
