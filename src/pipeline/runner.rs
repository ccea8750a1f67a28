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

use crate::pipeline::{parse_manifest, FailureLog, PipelineError};
use crate::repo::SnapshotStore;
use crate::route::ShardSpec;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

/// Cancellation handle shared between a runner and its controller.
/// Cancelling is idempotent; clones observe the same flag.
#[derive(Debug, Clone)]
pub struct Cancel {
    tx: Arc<watch::Sender<bool>>,
}

impl Cancel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Whether two handles control the same runner.
    pub fn same_as(&self, other: &Cancel) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

/// One live execution of a branch's pipeline set against one upstream
/// commit. For every manifest in `<data_repo>/<input_commit>/<manifest_dir>/`
/// the runner forks a scratch branch in the matching output repo, runs the
/// job, and seals the branch under the input commit's name. A failed job
/// discards its scratch branch and is recorded in the failure log.
pub struct Runner {
    manifest_dir: String,
    data_repo: String,
    output_prefix: String,
    input_commit: String,
    branch: String,
    shard: ShardSpec,
    store: Arc<dyn SnapshotStore>,
    failures: Arc<FailureLog>,
    cancel: Cancel,
}

impl Runner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest_dir: impl Into<String>,
        data_repo: impl Into<String>,
        output_prefix: impl Into<String>,
        input_commit: impl Into<String>,
        branch: impl Into<String>,
        shard: ShardSpec,
        store: Arc<dyn SnapshotStore>,
        failures: Arc<FailureLog>,
    ) -> Self {
        Self {
            manifest_dir: manifest_dir.into(),
            data_repo: data_repo.into(),
            output_prefix: output_prefix.into(),
            input_commit: input_commit.into(),
            branch: branch.into(),
            shard,
            store,
            failures,
            cancel: Cancel::new(),
        }
    }

    pub fn cancel_handle(&self) -> Cancel {
        self.cancel.clone()
    }

    /// Run every pipeline to completion. Returns the first failure after
    /// attempting the remaining pipelines, or Cancelled as soon as the
    /// cancellation flag is observed.
    pub async fn run(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let pattern = format!(
            "{}/{}/{}/*",
            self.data_repo, self.input_commit, self.manifest_dir
        );
        let manifests = self.store.glob(&pattern).await?;
        if manifests.is_empty() {
            tracing::debug!(
                commit = %self.input_commit,
                branch = %self.branch,
                "no pipelines for commit"
            );
            return Ok(());
        }

        let mut first_failure = None;
        for path in manifests {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if self.store.stat(&path).await?.is_dir {
                continue;
            }
            let name = match path.rsplit('/').next() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => continue,
            };
            match self.run_one(&name, &path).await {
                Ok(()) => {
                    tracing::info!(pipeline = %name, commit = %self.input_commit, "pipeline committed");
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    tracing::error!(pipeline = %name, commit = %self.input_commit, error = %e, "pipeline failed");
                    self.failures.record(&name, &self.input_commit);
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_one(&self, name: &str, manifest_path: &str) -> Result<(), PipelineError> {
        let mut reader = self.store.open(manifest_path).await?;
        let mut raw = Vec::new();
        reader.read_to_end(&mut raw).await?;
        let manifest = parse_manifest(name, &raw)?;

        let out_repo = format!("{}/{}", self.output_prefix, name);
        let scratch = format!("{out_repo}/{}", self.input_commit);
        self.store.ensure(&out_repo).await?;
        if self.store.is_commit(&scratch).await? {
            // Already materialized by an earlier run for this commit.
            return Ok(());
        }
        // A predecessor may have left a half-written scratch branch behind.
        self.store.remove(&scratch).await?;

        let latest = self.store.latest_commit(&out_repo).await?;
        self.store
            .branch(&out_repo, latest.as_deref(), &self.input_commit)
            .await?;

        if let Some(image) = &manifest.image {
            tracing::debug!(pipeline = %name, image = %image, "manifest image");
        }
        let input_dir = self
            .store
            .fs_path(&format!("{}/{}", self.data_repo, self.input_commit));
        let output_dir = self.store.fs_path(&scratch);
        let mut cmd = tokio::process::Command::new(&manifest.cmd[0]);
        cmd.args(&manifest.cmd[1..])
            .current_dir(&output_dir)
            .env("INPUT_DIR", &input_dir)
            .env("OUTPUT_DIR", &output_dir)
            .env("PIPELINE", name)
            .env("INPUT_COMMIT", &self.input_commit)
            .env("SHARD", self.shard.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    let _ = self.store.remove(&scratch).await;
                    return Err(PipelineError::Failed {
                        pipeline: name.to_string(),
                        commit: self.input_commit.clone(),
                    });
                }
            }
            _ = self.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                let _ = self.store.remove(&scratch).await;
                return Err(PipelineError::Cancelled);
            }
        }

        self.store
            .commit(&out_repo, &self.input_commit, &self.input_commit)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{wait_pipeline, MANIFEST_DIR};
    use crate::repo::{DirStore, Order};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn setup(manifest: &str) -> (tempfile::TempDir, Arc<dyn SnapshotStore>) {
        let dir = tempdir().unwrap();
        let store: Arc<dyn SnapshotStore> = Arc::new(DirStore::new(dir.path()).await.unwrap());
        store.ensure("data").await.unwrap();
        let mut body = "hello runner".as_bytes();
        store
            .create_from_reader("data/master/in.txt", &mut body)
            .await
            .unwrap();
        let mut body = manifest.as_bytes();
        store
            .create_from_reader(&format!("data/master/{MANIFEST_DIR}/job"), &mut body)
            .await
            .unwrap();
        store.commit("data", "c1", "master").await.unwrap();
        (dir, store)
    }

    fn runner(store: &Arc<dyn SnapshotStore>, failures: &Arc<FailureLog>) -> Runner {
        Runner::new(
            MANIFEST_DIR,
            "data",
            "pipe",
            "c1",
            "master",
            "0-1".parse().unwrap(),
            store.clone(),
            failures.clone(),
        )
    }

    #[tokio::test]
    async fn successful_job_seals_output_commit() {
        let manifest = "cmd = [\"sh\", \"-c\", \"cat \\\"$INPUT_DIR/in.txt\\\" > out.txt\"]\n";
        let (_dir, store) = setup(manifest).await;
        let failures = Arc::new(FailureLog::default());

        runner(&store, &failures).run().await.unwrap();

        assert!(store.is_commit("pipe/job/c1").await.unwrap());
        use tokio::io::AsyncReadExt;
        let mut reader = store.open("pipe/job/c1/out.txt").await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello runner");

        // Rerunning against the same commit is a no-op.
        runner(&store, &failures).run().await.unwrap();
        assert_eq!(
            store.commits("pipe/job", None, Order::Asc).await.unwrap(),
            vec!["c1"]
        );
    }

    #[tokio::test]
    async fn failing_job_discards_branch_and_records_failure() {
        let manifest = "cmd = [\"sh\", \"-c\", \"echo partial > junk.txt; exit 3\"]\n";
        let (_dir, store) = setup(manifest).await;
        let failures = Arc::new(FailureLog::default());

        let err = runner(&store, &failures).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::Failed { .. }));
        assert!(failures.contains("job", "c1"));
        assert!(!store.is_commit("pipe/job/c1").await.unwrap());
        assert!(store
            .branches("pipe/job")
            .await
            .unwrap()
            .iter()
            .all(|b| b != "c1"));

        let err = wait_pipeline(
            &store,
            &failures,
            "pipe",
            "job",
            "c1",
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PipelineError::Failed { .. }));
    }

    #[tokio::test]
    async fn cancel_before_run_short_circuits() {
        let manifest = "cmd = [\"sh\", \"-c\", \"true\"]\n";
        let (_dir, store) = setup(manifest).await;
        let failures = Arc::new(FailureLog::default());
        let r = runner(&store, &failures);
        r.cancel_handle().cancel();
        assert!(matches!(r.run().await, Err(PipelineError::Cancelled)));
        assert!(!store.is_commit("pipe/job/c1").await.unwrap());
    }

    #[tokio::test]
    async fn cancel_kills_in_flight_job() {
        let manifest = "cmd = [\"sh\", \"-c\", \"sleep 30\"]\n";
        let (_dir, store) = setup(manifest).await;
        let failures = Arc::new(FailureLog::default());
        let r = runner(&store, &failures);
        let cancel = r.cancel_handle();

        let handle = tokio::spawn(async move { r.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        cancel.cancel(); // idempotent

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("cancel must unblock the runner")
            .unwrap();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(!store.is_commit("pipe/job/c1").await.unwrap());
    }

    #[tokio::test]
    async fn bad_manifest_is_reported_and_logged() {
        let (_dir, store) = setup("cmd = []\n").await;
        let failures = Arc::new(FailureLog::default());
        let err = runner(&store, &failures).run().await.unwrap_err();
        assert!(matches!(err, PipelineError::BadManifest(..)));
        assert!(failures.contains("job", "c1"));
    }
}
