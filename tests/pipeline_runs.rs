use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use http_body_util::BodyExt;
use shardfs::config::RunnerConfig;
use shardfs::http;
use shardfs::repo::DirStore;
use shardfs::shard::Shard;
use shardfs::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tower::ServiceExt;

async fn app() -> (tempfile::TempDir, Arc<Shard>, Router) {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(DirStore::new(dir.path()).await.unwrap());
    let runner_cfg = RunnerConfig {
        poll_interval_ms: 20,
        wait_timeout_secs: 30,
    };
    let shard = Arc::new(Shard::new(
        store,
        "0-1".parse().unwrap(),
        Vec::new(),
        &runner_cfg,
    ));
    shard.ensure_repos().await.unwrap();
    let router = http::router(shard.clone());
    (dir, shard, router)
}

fn req(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (u16, String) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

const COPY_MANIFEST: &str =
    "image = \"busybox\"\ncmd = [\"sh\", \"-c\", \"cat \\\"$INPUT_DIR/in.txt\\\" > out\"]\n";

#[tokio::test]
async fn commit_triggers_pipeline_and_read_blocks_until_done() {
    let (_dir, _shard, app) = app().await;

    let (status, body) = send(&app, req(Method::POST, "/pipeline/copy", COPY_MANIFEST)).await;
    assert_eq!(status, 200, "{body}");
    assert!(body.starts_with("Created pipeline/copy, size:"), "{body}");

    let (status, _) = send(&app, req(Method::POST, "/file/in.txt?branch=master", "fed to the job")).await;
    assert_eq!(status, 200);
    let (status, body) = send(&app, req(Method::POST, "/commit?commit=C1", Body::empty())).await;
    assert_eq!(status, 200, "{body}");

    // Blocks until the runner has sealed the output commit, then serves it.
    let (status, body) = send(
        &app,
        req(Method::GET, "/pipeline/copy/file/out?commit=C1", Body::empty()),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body, "fed to the job");
}

#[tokio::test]
async fn failed_pipeline_surfaces_to_waiting_readers() {
    let (_dir, _shard, app) = app().await;

    let manifest = "cmd = [\"sh\", \"-c\", \"exit 7\"]\n";
    let (status, _) = send(&app, req(Method::POST, "/pipeline/broken", manifest)).await;
    assert_eq!(status, 200);
    let (status, _) = send(&app, req(Method::POST, "/commit?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);

    // The failure is recorded, so the waiter errors instead of timing out.
    let (status, body) = send(
        &app,
        req(Method::GET, "/pipeline/broken/file/out?commit=C1", Body::empty()),
    )
    .await;
    assert_eq!(status, 500, "{body}");
}

#[tokio::test]
async fn quick_successive_commits_swap_and_cancel_runners() {
    let (_dir, shard, app) = app().await;

    let manifest = "cmd = [\"sh\", \"-c\", \"sleep 30\"]\n";
    let (status, _) = send(&app, req(Method::POST, "/pipeline/slow", manifest)).await;
    assert_eq!(status, 200);

    let (status, _) = send(&app, req(Method::POST, "/commit?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);
    let first = shard.runner_handle("master").expect("runner for C1");

    let (status, _) = send(&app, req(Method::POST, "/commit?commit=C2", Body::empty())).await;
    assert_eq!(status, 200);
    let second = shard.runner_handle("master").expect("runner for C2");

    // One live runner per branch; the predecessor has been cancelled.
    assert!(!second.same_as(&first));
    tokio::time::timeout(Duration::from_secs(5), first.cancelled())
        .await
        .expect("first runner must observe cancellation");
    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());

    // The replacement stays the registered runner for the branch.
    let current = shard.runner_handle("master").unwrap();
    assert!(current.same_as(&second));
}

#[tokio::test]
async fn pipeline_output_chains_commit_history() {
    let (_dir, _shard, app) = app().await;

    let (status, _) = send(&app, req(Method::POST, "/pipeline/copy", COPY_MANIFEST)).await;
    assert_eq!(status, 200);

    let (status, _) = send(&app, req(Method::POST, "/file/in.txt?branch=master", "v1")).await;
    assert_eq!(status, 200);
    let (status, _) = send(&app, req(Method::POST, "/commit?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);
    let (status, body) = send(
        &app,
        req(Method::GET, "/pipeline/copy/file/out?commit=C1", Body::empty()),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body, "v1");

    let (status, _) = send(&app, req(Method::PUT, "/file/in.txt?branch=master", "v2")).await;
    assert_eq!(status, 200);
    let (status, _) = send(&app, req(Method::POST, "/commit?commit=C2", Body::empty())).await;
    assert_eq!(status, 200);
    let (status, body) = send(
        &app,
        req(Method::GET, "/pipeline/copy/file/out?commit=C2", Body::empty()),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body, "v2");
}
