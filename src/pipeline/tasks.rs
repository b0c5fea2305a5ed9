//! Supervised background work
//!
//! Key removal and tunnel session watchers run detached from the pipeline.
//! They are spawned into a `BackgroundTasks` set so the binary (and tests)
//! can wait for them instead of relying on wall-clock sleeps.

use std::future::Future;

use tokio_util::task::TaskTracker;
use tracing::{debug, Instrument};

#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    name: &'static str,
    tracker: TaskTracker,
}

impl BackgroundTasks {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn a detached task. The caller never awaits it.
    pub fn spawn<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let span = tracing::info_span!("background", set = self.name, task = %label);
        debug!(set = self.name, task = %label, "Spawning background task");
        self.tracker.spawn(task.instrument(span));
    }

    /// Number of tasks still running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Wait for every task spawned so far to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
