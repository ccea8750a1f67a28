// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use crate::config::RunnerConfig;
use crate::pipeline::{Cancel, FailureLog, PipelineError, Runner, MANIFEST_DIR};
use crate::repo::{SnapshotStore, StoreError};
use crate::route::ShardSpec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// One shard: the repos it owns, its slice of the key space, and the
/// commit controller state. The `runners` map is the only shared mutable
/// structure; its mutex covers map bookkeeping and never any job work.
pub struct Shard {
    pub(crate) data_repo: String,
    pub(crate) comp_repo: String,
    pub(crate) pipeline_prefix: String,
    pub(crate) spec: ShardSpec,
    pub(crate) peers: Vec<String>,
    pub(crate) store: Arc<dyn SnapshotStore>,
    pub(crate) failures: Arc<FailureLog>,
    pub(crate) poll_interval: Duration,
    pub(crate) wait_timeout: Duration,
    pub(crate) client: reqwest::Client,
    runners: Mutex<HashMap<String, Cancel>>,
}

impl Shard {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        spec: ShardSpec,
        peers: Vec<String>,
        runner: &RunnerConfig,
    ) -> Self {
        Self {
            data_repo: format!("data-{spec}"),
            comp_repo: format!("comp-{spec}"),
            pipeline_prefix: format!("pipe-{spec}"),
            spec,
            peers,
            store,
            failures: Arc::new(FailureLog::default()),
            poll_interval: Duration::from_millis(runner.poll_interval_ms),
            wait_timeout: Duration::from_secs(runner.wait_timeout_secs),
            client: reqwest::Client::new(),
            runners: Mutex::new(HashMap::new()),
        }
    }

    /// Create the data and scratch repos this shard owns.
    pub async fn ensure_repos(&self) -> Result<(), StoreError> {
        self.store.ensure(&self.data_repo).await?;
        self.store.ensure(&self.comp_repo).await?;
        Ok(())
    }

    /// Cancellation handle of the branch's live runner, if any.
    pub fn runner_handle(&self, branch: &str) -> Option<Cancel> {
        let runners = match self.runners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runners.get(branch).cloned()
    }

    fn replace_runner(&self, branch: &str, handle: Cancel) -> Option<Cancel> {
        let mut runners = match self.runners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        runners.insert(branch.to_string(), handle)
    }

    /// Seal the branch head under `requested` (or a fresh UUID), swap in a
    /// runner pinned to the new commit, and kick off peer sync. The old
    /// runner is cancelled before the new one starts; both run detached
    /// from the committing request, which only waits for the seal itself.
    pub async fn commit_local(
        self: &Arc<Self>,
        branch: &str,
        requested: Option<String>,
    ) -> Result<String, StoreError> {
        let name = requested.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.store.commit(&self.data_repo, &name, branch).await?;

        let runner = Runner::new(
            MANIFEST_DIR,
            &self.data_repo,
            &self.pipeline_prefix,
            &name,
            branch,
            self.spec,
            self.store.clone(),
            self.failures.clone(),
        );
        let old = self.replace_runner(branch, runner.cancel_handle());

        let commit = name.clone();
        let branch_name = branch.to_string();
        tokio::spawn(async move {
            if let Some(old) = old {
                old.cancel();
            }
            match runner.run().await {
                Ok(()) => {}
                Err(PipelineError::Cancelled) => {
                    tracing::debug!(branch = %branch_name, commit = %commit, "runner superseded");
                }
                Err(e) => {
                    tracing::error!(branch = %branch_name, commit = %commit, error = %e, "runner failed");
                }
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            crate::sync::sync_to_peers(this).await;
        });

        Ok(name)
    }
}
