use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod store;

pub use store::DirStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("missing commit: {0}")]
    MissingCommit(String),
    #[error("missing branch: {0}")]
    MissingBranch(String),
    #[error("branch already exists: {0}")]
    BranchExists(String),
    #[error("commit name already taken: {0}")]
    NameTaken(String),
    #[error("missing parent commit: {0}")]
    MissingParent(String),
    #[error("snapshot is sealed: {0}")]
    ReadOnly(String),
    #[error("corrupt snapshot metadata for {0}: {1}")]
    Corrupt(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Iteration order for sealed commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

/// Name and mod-time of a path inside a repo.
#[derive(Debug, Clone)]
pub struct Stat {
    pub name: String,
    pub modified: DateTime<Local>,
    pub is_dir: bool,
}

/// The changes one sealed commit introduces over its parent snapshot.
/// This is the unit shipped between shards during pull/push.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDelta {
    pub commit: String,
    pub parent: Option<String>,
    /// Directories created by this commit, repo-relative, parents first.
    pub dirs: Vec<String>,
    /// Files added or rewritten by this commit.
    pub files: Vec<DeltaFile>,
    /// Paths present in the parent but gone from this commit.
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaFile {
    pub path: String,
    pub data: Vec<u8>,
}

/// A snapshotting repository store. Paths are strings relative to the store
/// root, shaped `<repo>/<snapshot>[/<file>...]`; repo names may themselves
/// contain separators (pipeline repos live under `pipe-<shard>/<name>`).
///
/// Branches are writable snapshots, commits are sealed ones. Sealed trees
/// are never mutated through this interface.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Absolute filesystem location of a store path. External pipeline jobs
    /// are handed real directories through this.
    fn fs_path(&self, path: &str) -> PathBuf;

    /// Create the repo with an empty `master` branch if it does not exist.
    async fn ensure(&self, repo: &str) -> Result<(), StoreError>;

    /// Fork a new writable branch. `from` must name a sealed commit when
    /// given; `None` forks from scratch.
    async fn branch(
        &self,
        repo: &str,
        from: Option<&str>,
        new_branch: &str,
    ) -> Result<(), StoreError>;

    /// Seal the branch's current state under `name`. If `name` equals the
    /// branch name the branch is sealed in place and ceases to be writable;
    /// otherwise the sealed snapshot is copied out and the branch remains
    /// writable, forked from the new commit.
    async fn commit(&self, repo: &str, name: &str, branch: &str) -> Result<(), StoreError>;

    /// Sealed commit names in `order`. With `from`, only commits newer than
    /// `from` are returned; an unknown `from` is MissingCommit.
    async fn commits(
        &self,
        repo: &str,
        from: Option<&str>,
        order: Order,
    ) -> Result<Vec<String>, StoreError>;

    /// Writable branch names, lexicographic.
    async fn branches(&self, repo: &str) -> Result<Vec<String>, StoreError>;

    /// Name of the newest sealed commit, if any.
    async fn latest_commit(&self, repo: &str) -> Result<Option<String>, StoreError>;

    /// Whether the snapshot at `path` exists and is sealed.
    async fn is_commit(&self, path: &str) -> Result<bool, StoreError>;

    async fn stat(&self, path: &str) -> Result<Stat, StoreError>;

    /// Matching paths, lexicographic. Dot-prefixed bookkeeping entries are
    /// never returned.
    async fn glob(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Write a new file from the stream, creating parent directories.
    /// Returns bytes written.
    async fn create_from_reader(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError>;

    /// Overwrite or create a file from the stream. Returns bytes written.
    async fn copy_file(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError>;

    /// Delete a file, directory, or whole unsealed branch. Paths inside a
    /// sealed commit are refused with ReadOnly.
    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    async fn open(&self, path: &str)
        -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError>;

    /// Compute the delta a sealed commit introduces over its parent.
    async fn delta(&self, repo: &str, commit: &str) -> Result<CommitDelta, StoreError>;

    /// Apply a delta as a new sealed commit. Returns false without touching
    /// anything when the commit already exists; fails with MissingParent
    /// when the delta's parent has not been applied yet.
    async fn apply(&self, repo: &str, delta: CommitDelta) -> Result<bool, StoreError>;
}
