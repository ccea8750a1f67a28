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

use crate::repo::{CommitDelta, DeltaFile, Order, SnapshotStore, Stat, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use walkdir::WalkDir;

/// Default branch created for every repo.
pub const DEFAULT_BRANCH: &str = "master";

const META_DIR: &str = ".meta";
const STAGE_PREFIX: &str = ".stage-";

/// Per-snapshot bookkeeping, persisted as `<repo>/.meta/<snapshot>.json`.
/// A snapshot with a sequence number is sealed (a commit); without one it
/// is a writable branch. Sequence numbers give commits their total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    parent: Option<String>,
    seq: Option<u64>,
    sealed_at_unix_secs: Option<i64>,
}

impl SnapshotMeta {
    fn sealed(&self) -> bool {
        self.seq.is_some()
    }
}

#[derive(Debug)]
struct Located {
    repo: String,
    snapshot: String,
    rel: String,
}

/// Snapshot store over plain directories. Snapshots are subdirectories of
/// the repo directory, named as supplied; sealing is recorded in the
/// `.meta/` bookkeeping dir and sealed trees are never written again.
/// Branching and committing copy trees, which trades the copy-on-write
/// driver's O(1) snapshots for portability while keeping the same
/// observable semantics.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn abs(&self, path: &str) -> PathBuf {
        let mut p = self.root.clone();
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            p.push(comp);
        }
        p
    }

    fn meta_file(&self, repo: &str, snapshot: &str) -> PathBuf {
        self.abs(repo).join(META_DIR).join(format!("{snapshot}.json"))
    }

    async fn repo_exists(&self, repo: &str) -> bool {
        fs::try_exists(self.abs(repo).join(META_DIR))
            .await
            .unwrap_or(false)
    }

    async fn read_meta(
        &self,
        repo: &str,
        snapshot: &str,
    ) -> Result<Option<SnapshotMeta>, StoreError> {
        match fs::read(self.meta_file(repo, snapshot)).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt(format!("{repo}/{snapshot}"), e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(
        &self,
        repo: &str,
        snapshot: &str,
        meta: &SnapshotMeta,
    ) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| StoreError::Corrupt(format!("{repo}/{snapshot}"), e.to_string()))?;
        fs::write(self.meta_file(repo, snapshot), bytes).await?;
        Ok(())
    }

    /// All snapshots of a repo with their bookkeeping.
    async fn snapshots(&self, repo: &str) -> Result<Vec<(String, SnapshotMeta)>, StoreError> {
        if !self.repo_exists(repo).await {
            return Err(StoreError::NotFound(repo.to_string()));
        }
        let mut out = Vec::new();
        let mut entries = fs::read_dir(self.abs(repo).join(META_DIR)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(meta) = self.read_meta(repo, name).await? {
                out.push((name.to_string(), meta));
            }
        }
        Ok(out)
    }

    async fn next_seq(&self, repo: &str) -> Result<u64, StoreError> {
        let max = self
            .snapshots(repo)
            .await?
            .into_iter()
            .filter_map(|(_, m)| m.seq)
            .max();
        Ok(max.map_or(0, |s| s + 1))
    }

    /// Resolve a store path into its repo, snapshot, and file remainder.
    /// The repo boundary is the first prefix carrying a `.meta` dir, which
    /// lets repo names themselves contain separators.
    async fn locate(&self, path: &str) -> Result<Located, StoreError> {
        let comps: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for i in 1..comps.len() {
            let repo = comps[..i].join("/");
            if self.repo_exists(&repo).await {
                return Ok(Located {
                    repo,
                    snapshot: comps[i].to_string(),
                    rel: comps[i + 1..].join("/"),
                });
            }
        }
        Err(StoreError::NotFound(path.to_string()))
    }

    /// Locate a path and require its snapshot to be a writable branch.
    async fn writable(&self, path: &str) -> Result<Located, StoreError> {
        let loc = self.locate(path).await?;
        match self.read_meta(&loc.repo, &loc.snapshot).await? {
            None => Err(StoreError::MissingBranch(loc.snapshot.clone())),
            Some(meta) if meta.sealed() => Err(StoreError::ReadOnly(path.to_string())),
            Some(_) => Ok(loc),
        }
    }

    async fn write_stream(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError> {
        let loc = self.writable(path).await?;
        if loc.rel.is_empty() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{path} names a snapshot, not a file"),
            )));
        }
        let full = self.abs(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::File::create(&full).await?;
        let mut writer = BufWriter::new(file);
        let written = tokio::io::copy(reader, &mut writer).await?;
        writer.flush().await?;
        Ok(written)
    }

    async fn copy_tree(&self, src: PathBuf, dst: PathBuf) -> Result<(), StoreError> {
        tokio::task::spawn_blocking(move || copy_tree_blocking(&src, &dst))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }
}

fn copy_tree_blocking(src: &Path, dst: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Relative paths arriving in deltas from peers must stay inside the
/// snapshot they target.
fn check_delta_path(path: &str) -> Result<(), StoreError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.split('/').any(|c| c.is_empty() || c == "." || c == "..");
    if bad {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("bad delta path {path:?}"),
        )));
    }
    Ok(())
}

fn build_delta_blocking(
    commit_abs: PathBuf,
    parent_abs: Option<PathBuf>,
    commit: String,
    parent: Option<String>,
) -> Result<CommitDelta, StoreError> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in WalkDir::new(&commit_abs).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let rel = entry
            .path()
            .strip_prefix(&commit_abs)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        let in_parent = parent_abs.as_ref().map(|p| p.join(rel));
        if entry.file_type().is_dir() {
            let exists = in_parent.as_ref().is_some_and(|p| p.is_dir());
            if !exists {
                dirs.push(rel_str);
            }
        } else {
            let data = std::fs::read(entry.path())?;
            let unchanged = match in_parent {
                Some(p) if p.is_file() => std::fs::read(&p)? == data,
                _ => false,
            };
            if !unchanged {
                files.push(DeltaFile { path: rel_str, data });
            }
        }
    }

    let mut removed = Vec::new();
    if let Some(parent_abs) = &parent_abs {
        for entry in WalkDir::new(parent_abs).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            let rel = entry
                .path()
                .strip_prefix(parent_abs)
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
            if !commit_abs.join(rel).exists() {
                removed.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    // Deepest paths first so files go before their directories.
    removed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));

    Ok(CommitDelta {
        commit,
        parent,
        dirs,
        files,
        removed,
    })
}

#[async_trait]
impl SnapshotStore for DirStore {
    fn fs_path(&self, path: &str) -> PathBuf {
        self.abs(path)
    }

    async fn ensure(&self, repo: &str) -> Result<(), StoreError> {
        if self.repo_exists(repo).await {
            return Ok(());
        }
        fs::create_dir_all(self.abs(repo).join(META_DIR)).await?;
        fs::create_dir_all(self.abs(repo).join(DEFAULT_BRANCH)).await?;
        self.write_meta(
            repo,
            DEFAULT_BRANCH,
            &SnapshotMeta {
                parent: None,
                seq: None,
                sealed_at_unix_secs: None,
            },
        )
        .await
    }

    async fn branch(
        &self,
        repo: &str,
        from: Option<&str>,
        new_branch: &str,
    ) -> Result<(), StoreError> {
        if !self.repo_exists(repo).await {
            return Err(StoreError::NotFound(repo.to_string()));
        }
        if self.read_meta(repo, new_branch).await?.is_some() {
            return Err(StoreError::BranchExists(new_branch.to_string()));
        }
        match from {
            Some(commit) => {
                match self.read_meta(repo, commit).await? {
                    Some(meta) if meta.sealed() => {}
                    _ => return Err(StoreError::MissingCommit(commit.to_string())),
                }
                self.copy_tree(
                    self.abs(&format!("{repo}/{commit}")),
                    self.abs(&format!("{repo}/{new_branch}")),
                )
                .await?;
            }
            None => {
                fs::create_dir_all(self.abs(&format!("{repo}/{new_branch}"))).await?;
            }
        }
        self.write_meta(
            repo,
            new_branch,
            &SnapshotMeta {
                parent: from.map(str::to_string),
                seq: None,
                sealed_at_unix_secs: None,
            },
        )
        .await
    }

    async fn commit(&self, repo: &str, name: &str, branch: &str) -> Result<(), StoreError> {
        let branch_meta = match self.read_meta(repo, branch).await? {
            Some(meta) if !meta.sealed() => meta,
            _ => return Err(StoreError::MissingBranch(branch.to_string())),
        };
        let seq = self.next_seq(repo).await?;
        let sealed = SnapshotMeta {
            parent: branch_meta.parent.clone(),
            seq: Some(seq),
            sealed_at_unix_secs: Some(Utc::now().timestamp()),
        };
        if name == branch {
            // Seal in place; the branch ceases to exist as a writable head.
            return self.write_meta(repo, branch, &sealed).await;
        }
        if self.read_meta(repo, name).await?.is_some() {
            return Err(StoreError::NameTaken(name.to_string()));
        }
        self.copy_tree(
            self.abs(&format!("{repo}/{branch}")),
            self.abs(&format!("{repo}/{name}")),
        )
        .await?;
        self.write_meta(repo, name, &sealed).await?;
        // The branch keeps accumulating on top of the commit it just made.
        self.write_meta(
            repo,
            branch,
            &SnapshotMeta {
                parent: Some(name.to_string()),
                seq: None,
                sealed_at_unix_secs: None,
            },
        )
        .await
    }

    async fn commits(
        &self,
        repo: &str,
        from: Option<&str>,
        order: Order,
    ) -> Result<Vec<String>, StoreError> {
        let mut sealed: Vec<(u64, String)> = self
            .snapshots(repo)
            .await?
            .into_iter()
            .filter_map(|(name, meta)| meta.seq.map(|seq| (seq, name)))
            .collect();
        sealed.sort();
        if let Some(from) = from {
            let from_seq = sealed
                .iter()
                .find(|(_, name)| name == from)
                .map(|(seq, _)| *seq)
                .ok_or_else(|| StoreError::MissingCommit(from.to_string()))?;
            sealed.retain(|(seq, _)| *seq > from_seq);
        }
        let mut names: Vec<String> = sealed.into_iter().map(|(_, name)| name).collect();
        if order == Order::Desc {
            names.reverse();
        }
        Ok(names)
    }

    async fn branches(&self, repo: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = self
            .snapshots(repo)
            .await?
            .into_iter()
            .filter(|(_, meta)| !meta.sealed())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn latest_commit(&self, repo: &str) -> Result<Option<String>, StoreError> {
        Ok(self.commits(repo, None, Order::Desc).await?.into_iter().next())
    }

    async fn is_commit(&self, path: &str) -> Result<bool, StoreError> {
        let loc = match self.locate(path).await {
            Ok(loc) => loc,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(self
            .read_meta(&loc.repo, &loc.snapshot)
            .await?
            .is_some_and(|meta| meta.sealed()))
    }

    async fn stat(&self, path: &str) -> Result<Stat, StoreError> {
        let full = self.abs(path);
        let meta = fs::metadata(&full)
            .await
            .map_err(|_| StoreError::NotFound(path.to_string()))?;
        let modified: DateTime<Local> = meta
            .modified()
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        let name = path
            .rsplit('/')
            .find(|c| !c.is_empty())
            .unwrap_or(path)
            .to_string();
        Ok(Stat {
            name,
            modified,
            is_dir: meta.is_dir(),
        })
    }

    async fn glob(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let root = self.root.clone();
        let full = self.abs(pattern);
        let pattern_str = full.to_string_lossy().into_owned();
        tokio::task::spawn_blocking(move || {
            let entries = glob::glob(&pattern_str).map_err(|e| {
                StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
            })?;
            let mut out = Vec::new();
            for entry in entries {
                let path = entry.map_err(|e| StoreError::Io(e.into_error()))?;
                let rel = match path.strip_prefix(&root) {
                    Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                    Err(_) => continue,
                };
                if rel.split('/').any(|c| c.starts_with('.')) {
                    continue;
                }
                out.push(rel);
            }
            out.sort();
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    async fn create_from_reader(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError> {
        self.write_stream(path, reader).await
    }

    async fn copy_file(
        &self,
        path: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<u64, StoreError> {
        self.write_stream(path, reader).await
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let loc = self.locate(path).await?;
        if let Some(meta) = self.read_meta(&loc.repo, &loc.snapshot).await? {
            if meta.sealed() {
                return Err(StoreError::ReadOnly(path.to_string()));
            }
        }
        if loc.rel.is_empty() {
            // Removing a whole branch drops its bookkeeping too.
            match fs::remove_dir_all(self.abs(path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            match fs::remove_file(self.meta_file(&loc.repo, &loc.snapshot)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
        let full = self.abs(path);
        let meta = fs::metadata(&full)
            .await
            .map_err(|_| StoreError::NotFound(path.to_string()))?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await?;
        } else {
            fs::remove_file(&full).await?;
        }
        Ok(())
    }

    async fn open(
        &self,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StoreError> {
        let file = fs::File::open(self.abs(path))
            .await
            .map_err(|_| StoreError::NotFound(path.to_string()))?;
        Ok(Box::new(file))
    }

    async fn delta(&self, repo: &str, commit: &str) -> Result<CommitDelta, StoreError> {
        let meta = match self.read_meta(repo, commit).await? {
            Some(meta) if meta.sealed() => meta,
            _ => return Err(StoreError::MissingCommit(commit.to_string())),
        };
        let commit_abs = self.abs(&format!("{repo}/{commit}"));
        let parent_abs = meta
            .parent
            .as_ref()
            .map(|p| self.abs(&format!("{repo}/{p}")));
        let commit = commit.to_string();
        tokio::task::spawn_blocking(move || {
            build_delta_blocking(commit_abs, parent_abs, commit, meta.parent)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    async fn apply(&self, repo: &str, delta: CommitDelta) -> Result<bool, StoreError> {
        self.ensure(repo).await?;
        if let Some(meta) = self.read_meta(repo, &delta.commit).await? {
            if meta.sealed() {
                // Replays are a no-op; pull/push stays idempotent.
                return Ok(false);
            }
            return Err(StoreError::NameTaken(delta.commit.clone()));
        }
        if let Some(parent) = &delta.parent {
            match self.read_meta(repo, parent).await? {
                Some(meta) if meta.sealed() => {}
                _ => return Err(StoreError::MissingParent(parent.clone())),
            }
        }

        let stage_rel = format!("{repo}/{STAGE_PREFIX}{}", delta.commit);
        let stage_abs = self.abs(&stage_rel);
        let _ = fs::remove_dir_all(&stage_abs).await;
        match &delta.parent {
            Some(parent) => {
                self.copy_tree(self.abs(&format!("{repo}/{parent}")), stage_abs.clone())
                    .await?;
            }
            None => fs::create_dir_all(&stage_abs).await?,
        }

        for path in &delta.removed {
            check_delta_path(path)?;
            let target = stage_abs.join(path);
            match fs::metadata(&target).await {
                Ok(meta) if meta.is_dir() => {
                    let _ = fs::remove_dir_all(&target).await;
                }
                Ok(_) => {
                    let _ = fs::remove_file(&target).await;
                }
                Err(_) => {}
            }
        }
        for dir in &delta.dirs {
            check_delta_path(dir)?;
            fs::create_dir_all(stage_abs.join(dir)).await?;
        }
        for file in &delta.files {
            check_delta_path(&file.path)?;
            let target = stage_abs.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, &file.data).await?;
        }

        let commit_abs = self.abs(&format!("{repo}/{}", delta.commit));
        fs::rename(&stage_abs, &commit_abs).await?;
        let seq = self.next_seq(repo).await?;
        self.write_meta(
            repo,
            &delta.commit,
            &SnapshotMeta {
                parent: delta.parent.clone(),
                seq: Some(seq),
                sealed_at_unix_secs: Some(Utc::now().timestamp()),
            },
        )
        .await?;
        Ok(true)
    }
}
