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

use clap::Parser;
use shardfs::config::Config;
use shardfs::repo::DirStore;
use shardfs::route::ShardSpec;
use shardfs::shard::Shard;
use shardfs::{http, trace, SnapshotStore};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "shardfs")]
#[command(about = "One shard of a snapshotting data and pipeline cluster", long_about = None)]
struct Args {
    /// Key-space slice owned by this shard, as <shard>-<modulos> (e.g. 0-2)
    shard: String,

    /// Peer shard base URLs to propagate commits to (e.g. http://10.0.0.2:80)
    peers: Vec<String>,

    /// Address to listen on; overrides the config file
    #[arg(short, long)]
    listen: Option<String>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let spec: ShardSpec = args.shard.parse()?;
    trace::init(&spec);

    let mut cfg = Config::from_path(&args.config)?;
    cfg.peers.extend(args.peers);
    let listen = args.listen.as_ref().unwrap_or(&cfg.listen_addr);

    let store: Arc<dyn SnapshotStore> = Arc::new(DirStore::new(&cfg.storage.root).await?);
    let shard = Arc::new(Shard::new(store, spec, cfg.peers.clone(), &cfg.runner));
    shard.ensure_repos().await?;

    let app = http::router(shard);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, shard = %spec, peers = cfg.peers.len(), "shardfs listening");

    tokio::select! {
        r = axum::serve(listener, app) => {
            if let Err(e) = r {
                tracing::error!("server exited with error: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}
