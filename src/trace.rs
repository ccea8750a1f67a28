use crate::route::ShardSpec;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the tracing subscriber for one shard process. `RUST_LOG`
/// controls the filter (default `shardfs=info`); `LOG_FORMAT=json`
/// switches to JSON lines for log aggregation. The shard identity is
/// logged up front so interleaved cluster logs can be told apart.
pub fn init(spec: &ShardSpec) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("shardfs=info,tower=warn,axum=info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    tracing::info!(shard = spec.shard, modulos = spec.modulos, json, "tracing initialized");
}
