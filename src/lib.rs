pub mod config;
pub mod http;
pub mod multipart;
pub mod pipeline;
pub mod replica;
pub mod repo;
pub mod route;
pub mod shard;
pub mod sync;
pub mod trace;

pub use repo::{DirStore, SnapshotStore};
pub use route::ShardSpec;
pub use shard::Shard;
