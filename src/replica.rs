use crate::multipart::{self, MultipartError};
use crate::repo::{CommitDelta, Order, SnapshotStore, StoreError};
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("bad snapshot delta in part {0:?}: {1}")]
    BadDelta(String, String),
}

/// Pull/push endpoint over one local repo. Pull emits one multipart part
/// per sealed commit newer than `from`, ascending, each carrying a
/// bincode-encoded [`CommitDelta`]; push applies such a body in order.
/// The two compose idempotently: replaying a pulled body is a no-op for
/// every commit the replica already holds.
#[derive(Clone)]
pub struct LocalReplica {
    store: Arc<dyn SnapshotStore>,
    repo: String,
}

impl LocalReplica {
    pub fn new(store: Arc<dyn SnapshotStore>, repo: impl Into<String>) -> Self {
        Self {
            store,
            repo: repo.into(),
        }
    }

    /// Stream the multipart pull body into `tx`, one frame at a time.
    /// Commits sealed after iteration starts are picked up by the next pull.
    pub async fn pull(
        &self,
        from: Option<&str>,
        boundary: &str,
        tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    ) -> Result<(), ReplicaError> {
        let commits = self.store.commits(&self.repo, from, Order::Asc).await?;
        for commit in commits {
            let delta = self.store.delta(&self.repo, &commit).await?;
            let encoded = bincode::serialize(&delta)
                .map_err(|e| ReplicaError::BadDelta(commit.clone(), e.to_string()))?;
            let frames = [
                multipart::part_header(boundary, &commit),
                Bytes::from(encoded),
                multipart::part_trailer(),
            ];
            for frame in frames {
                if tx.send(Ok(frame)).await.is_err() {
                    // Receiver hung up; nothing left to stream to.
                    return Ok(());
                }
            }
        }
        let _ = tx.send(Ok(multipart::close_delimiter(boundary))).await;
        Ok(())
    }

    /// Apply a previously pulled multipart body. Returns how many commits
    /// were newly created.
    pub async fn push(&self, body: &[u8], boundary: &str) -> Result<usize, ReplicaError> {
        let parts = multipart::parse(body, boundary)?;
        let mut created = 0;
        for part in parts {
            let delta: CommitDelta = bincode::deserialize(&part.data)
                .map_err(|e| ReplicaError::BadDelta(part.name.clone(), e.to_string()))?;
            if delta.commit != part.name {
                return Err(ReplicaError::BadDelta(
                    part.name,
                    format!("part carries delta for {:?}", delta.commit),
                ));
            }
            if self.store.apply(&self.repo, delta).await? {
                created += 1;
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::DirStore;
    use tempfile::tempdir;

    async fn seeded_replica(dir: &tempfile::TempDir) -> LocalReplica {
        let store: Arc<dyn SnapshotStore> = Arc::new(DirStore::new(dir.path()).await.unwrap());
        store.ensure("data").await.unwrap();
        let mut body = "hello".as_bytes();
        store
            .create_from_reader("data/master/greeting", &mut body)
            .await
            .unwrap();
        store.commit("data", "c1", "master").await.unwrap();
        let mut body = "world".as_bytes();
        store
            .create_from_reader("data/master/audience", &mut body)
            .await
            .unwrap();
        store.commit("data", "c2", "master").await.unwrap();
        LocalReplica::new(store, "data")
    }

    async fn collect_pull(replica: &LocalReplica, from: Option<&str>, boundary: &str) -> Vec<u8> {
        let (tx, mut rx) = mpsc::channel(16);
        replica.pull(from, boundary, tx).await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = rx.recv().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        body
    }

    #[tokio::test]
    async fn pull_then_push_reproduces_history() {
        let src_dir = tempdir().unwrap();
        let src = seeded_replica(&src_dir).await;

        let boundary = multipart::new_boundary();
        let body = collect_pull(&src, None, &boundary).await;

        let dst_dir = tempdir().unwrap();
        let dst_store: Arc<dyn SnapshotStore> =
            Arc::new(DirStore::new(dst_dir.path()).await.unwrap());
        let dst = LocalReplica::new(dst_store.clone(), "data");

        assert_eq!(dst.push(&body, &boundary).await.unwrap(), 2);
        assert_eq!(
            dst_store.commits("data", None, Order::Asc).await.unwrap(),
            vec!["c1", "c2"]
        );

        // Replays create nothing new.
        assert_eq!(dst.push(&body, &boundary).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pull_from_skips_older_commits() {
        let src_dir = tempdir().unwrap();
        let src = seeded_replica(&src_dir).await;

        let boundary = multipart::new_boundary();
        let body = collect_pull(&src, Some("c1"), &boundary).await;
        let parts = multipart::parse(&body, &boundary).unwrap();
        let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["c2"]);
    }

    #[tokio::test]
    async fn push_without_parent_fails() {
        let src_dir = tempdir().unwrap();
        let src = seeded_replica(&src_dir).await;

        let boundary = multipart::new_boundary();
        let body = collect_pull(&src, Some("c1"), &boundary).await;

        let dst_dir = tempdir().unwrap();
        let dst_store: Arc<dyn SnapshotStore> =
            Arc::new(DirStore::new(dst_dir.path()).await.unwrap());
        let dst = LocalReplica::new(dst_store, "data");
        assert!(matches!(
            dst.push(&body, &boundary).await,
            Err(ReplicaError::Store(StoreError::MissingParent(_)))
        ));
    }
}
