use crate::repo::{SnapshotStore, StoreError};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub mod runner;

pub use runner::{Cancel, Runner};

/// Directory inside a data-repo branch that holds pipeline manifests.
pub const MANIFEST_DIR: &str = "pipeline";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline {pipeline} failed for commit {commit}")]
    Failed { pipeline: String, commit: String },
    #[error("pipeline run cancelled")]
    Cancelled,
    #[error("timed out waiting for pipeline {pipeline} to commit {commit}")]
    Timeout { pipeline: String, commit: String },
    #[error("bad manifest for pipeline {0}: {1}")]
    BadManifest(String, String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A pipeline manifest, one TOML file under `pipeline/<name>` in a data
/// repo. Edits take effect on the next commit of the enclosing branch.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Program and arguments run for each input commit.
    pub cmd: Vec<String>,
    /// Container image the job expects. Recorded for the job's benefit;
    /// execution of `cmd` is handed to the configured runtime as-is.
    pub image: Option<String>,
    /// Input references, informational.
    #[serde(default)]
    pub inputs: Vec<String>,
}

pub fn parse_manifest(pipeline: &str, bytes: &[u8]) -> Result<Manifest, PipelineError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| PipelineError::BadManifest(pipeline.to_string(), e.to_string()))?;
    let manifest: Manifest = toml::from_str(text)
        .map_err(|e| PipelineError::BadManifest(pipeline.to_string(), e.to_string()))?;
    if manifest.cmd.is_empty() {
        return Err(PipelineError::BadManifest(
            pipeline.to_string(),
            "cmd must name a program".to_string(),
        ));
    }
    Ok(manifest)
}

/// Failed (pipeline, commit) pairs. Runners record here when a job exits
/// non-zero so that waiters stop blocking instead of running into their
/// timeout.
#[derive(Debug, Default)]
pub struct FailureLog {
    failed: Mutex<HashSet<(String, String)>>,
}

impl FailureLog {
    pub fn record(&self, pipeline: &str, commit: &str) {
        if let Ok(mut failed) = self.failed.lock() {
            failed.insert((pipeline.to_string(), commit.to_string()));
        }
    }

    pub fn contains(&self, pipeline: &str, commit: &str) -> bool {
        self.failed
            .lock()
            .map(|failed| failed.contains(&(pipeline.to_string(), commit.to_string())))
            .unwrap_or(false)
    }
}

/// Block until `<prefix>/<pipeline>` holds a sealed commit named `commit`,
/// the runner records a failure for it, or `timeout` elapses.
pub async fn wait_pipeline(
    store: &Arc<dyn SnapshotStore>,
    failures: &FailureLog,
    prefix: &str,
    pipeline: &str,
    commit: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<(), PipelineError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let path = format!("{prefix}/{pipeline}/{commit}");
    loop {
        if failures.contains(pipeline, commit) {
            return Err(PipelineError::Failed {
                pipeline: pipeline.to_string(),
                commit: commit.to_string(),
            });
        }
        if store.is_commit(&path).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PipelineError::Timeout {
                pipeline: pipeline.to_string(),
                commit: commit.to_string(),
            });
        }
        tokio::time::sleep(poll).await;
    }
}
