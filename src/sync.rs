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

use crate::multipart;
use crate::replica::{LocalReplica, ReplicaError};
use crate::shard::Shard;
use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error("peer {0} rejected push with status {1}")]
    Rejected(String, StatusCode),
}

/// Propagate this shard's commit history to every peer. Runs detached
/// after each commit; failures are logged and the next commit retries
/// from scratch, so peers converge eventually.
pub async fn sync_to_peers(shard: Arc<Shard>) {
    if shard.peers.is_empty() {
        return;
    }
    let replica = LocalReplica::new(shard.store.clone(), shard.data_repo.clone());
    for peer in &shard.peers {
        match push_to_peer(&shard, &replica, peer).await {
            Ok(()) => tracing::debug!(peer = %peer, "peer sync complete"),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "peer sync failed"),
        }
    }
}

/// Pull the full local history and stream it as a push to one peer.
/// The peer skips commits it already holds, so replaying the whole
/// history is cheap and keeps the transfer idempotent.
async fn push_to_peer(
    shard: &Shard,
    replica: &LocalReplica,
    peer: &str,
) -> Result<(), SyncError> {
    let boundary = multipart::new_boundary();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);

    let send = shard
        .client
        .post(format!("{peer}/commit"))
        .header("Boundary", boundary.as_str())
        .header(
            reqwest::header::CONTENT_TYPE,
            multipart::content_type(&boundary),
        )
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
        .send();
    let pull = replica.pull(None, &boundary, tx);

    let (resp, pulled) = tokio::join!(send, pull);
    pulled?;
    let resp = resp?;
    if !resp.status().is_success() {
        return Err(SyncError::Rejected(peer.to_string(), resp.status()));
    }
    Ok(())
}
