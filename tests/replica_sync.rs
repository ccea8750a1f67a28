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

use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use http_body_util::BodyExt;
use shardfs::config::RunnerConfig;
use shardfs::http;
use shardfs::multipart;
use shardfs::repo::DirStore;
use shardfs::shard::Shard;
use shardfs::SnapshotStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tower::ServiceExt;

async fn node(peers: Vec<String>) -> (tempfile::TempDir, Arc<Shard>, Router) {
    let dir = tempdir().unwrap();
    let store: Arc<dyn SnapshotStore> = Arc::new(DirStore::new(dir.path()).await.unwrap());
    let shard = Arc::new(Shard::new(
        store,
        "0-1".parse().unwrap(),
        peers,
        &RunnerConfig::default(),
    ));
    shard.ensure_repos().await.unwrap();
    let router = http::router(shard.clone());
    (dir, shard, router)
}

async fn send(app: &Router, request: Request<Body>) -> (u16, String) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status().as_u16();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&body).to_string())
}

fn req(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(body.into())
        .unwrap()
}

async fn seed(app: &Router) {
    let (status, _) = send(app, req(Method::POST, "/file/greeting?branch=master", "hello")).await;
    assert_eq!(status, 200);
    let (status, _) = send(app, req(Method::POST, "/commit?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);
    let (status, _) = send(app, req(Method::POST, "/file/audience?branch=master", "world")).await;
    assert_eq!(status, 200);
    let (status, _) = send(app, req(Method::POST, "/commit?commit=C2", Body::empty())).await;
    assert_eq!(status, 200);
}

async fn pull_body(app: &Router, uri: &str) -> (String, bytes::Bytes) {
    let resp = app.clone().oneshot(req(Method::GET, uri, Body::empty())).await.unwrap();
    assert_eq!(resp.status(), 200);
    let boundary = resp
        .headers()
        .get("Boundary")
        .expect("pull publishes its boundary")
        .to_str()
        .unwrap()
        .to_string();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (boundary, body)
}

async fn commit_names(app: &Router) -> Vec<String> {
    let (status, body) = send(app, req(Method::GET, "/commit", Body::empty())).await;
    assert_eq!(status, 200);
    body.lines()
        .map(|l| {
            let v: serde_json::Value = serde_json::from_str(l).unwrap();
            v["Name"].as_str().unwrap().to_string()
        })
        .collect()
}

#[tokio::test]
async fn pull_applied_to_empty_node_reproduces_history() {
    let (_xdir, _x, x_app) = node(Vec::new()).await;
    seed(&x_app).await;

    let (boundary, body) = pull_body(&x_app, "/pull").await;
    let parts = multipart::parse(&body, &boundary).unwrap();
    let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["C1", "C2"]);

    let (_ydir, _y, y_app) = node(Vec::new()).await;
    let push = Request::builder()
        .method(Method::POST)
        .uri("/commit")
        .header("Boundary", &boundary)
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, push_body) = send(&y_app, push).await;
    assert_eq!(status, 200, "{push_body}");

    assert_eq!(commit_names(&y_app).await, vec!["C2", "C1"]);
    let (status, content) = send(&y_app, req(Method::GET, "/file/greeting?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);
    assert_eq!(content, "hello");

    // Replaying the same push is a no-op.
    let replay = Request::builder()
        .method(Method::POST)
        .uri("/commit")
        .header("Boundary", &boundary)
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send(&y_app, replay).await;
    assert_eq!(status, 200);
    assert_eq!(commit_names(&y_app).await, vec!["C2", "C1"]);
}

#[tokio::test]
async fn pull_from_streams_only_newer_commits() {
    let (_xdir, _x, x_app) = node(Vec::new()).await;
    seed(&x_app).await;

    let (boundary, body) = pull_body(&x_app, "/pull?from=C1").await;
    let parts = multipart::parse(&body, &boundary).unwrap();
    let names: Vec<&str> = parts.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["C2"]);

    let (status, _) = send(&x_app, req(Method::GET, "/pull?from=unknown", Body::empty())).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn push_missing_parent_is_rejected() {
    let (_xdir, _x, x_app) = node(Vec::new()).await;
    seed(&x_app).await;
    let (boundary, body) = pull_body(&x_app, "/pull?from=C1").await;

    let (_ydir, _y, y_app) = node(Vec::new()).await;
    let push = Request::builder()
        .method(Method::POST)
        .uri("/commit")
        .header("Boundary", &boundary)
        .body(Body::from(body))
        .unwrap();
    let (status, body) = send(&y_app, push).await;
    assert_eq!(status, 409, "{body}");
}

#[tokio::test]
async fn commits_propagate_to_peers_in_the_background() {
    let (_ydir, _y, y_app) = node(Vec::new()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_url = format!("http://{}", listener.local_addr().unwrap());
    {
        let y_app = y_app.clone();
        tokio::spawn(async move {
            axum::serve(listener, y_app).await.unwrap();
        });
    }

    let (_xdir, _x, x_app) = node(vec![peer_url]).await;
    let (status, _) = send(&x_app, req(Method::POST, "/file/a?branch=master", "payload")).await;
    assert_eq!(status, 200);
    let (status, _) = send(&x_app, req(Method::POST, "/commit?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);

    // Sync is fire-and-forget; poll the peer until the commit lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if commit_names(&y_app).await == vec!["C1".to_string()] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peer never converged"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let (status, content) = send(&y_app, req(Method::GET, "/file/a?commit=C1", Body::empty())).await;
    assert_eq!(status, 200);
    assert_eq!(content, "payload");
}
