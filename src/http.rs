use crate::multipart;
use crate::pipeline::{wait_pipeline, PipelineError};
use crate::replica::{LocalReplica, ReplicaError};
use crate::repo::{Order, SnapshotStore, StoreError};
use crate::route::ShardSpec;
use crate::shard::Shard;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const TSTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";
const DEFAULT_REF: &str = "master";
const STREAM_CHUNK: usize = 64 * 1024;

/// Build the shard's HTTP surface. Fixed endpoints get typed routes; any
/// URL with a `file` segment (`/file/...`, `/commit/<c>/file/...`,
/// `/branch/<b>/file/...`, `/pipeline/<p>/file/...`) falls through to the
/// file dispatcher, which roots itself at the snapshot the prefix implies.
pub fn router(shard: Arc<Shard>) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/commit", get(list_commits).post(post_commit))
        .route("/branch", get(list_branches).post(create_branch))
        .route("/pipeline/:name", post(upload_manifest))
        .route("/pull", get(pull))
        .fallback(dispatch_files)
        .layer(DefaultBodyLimit::disable())
        .with_state(shard)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    MethodNotAllowed(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::MethodNotAllowed(m) => (StatusCode::METHOD_NOT_ALLOWED, m),
            ApiError::Timeout(m) => (StatusCode::GATEWAY_TIMEOUT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, format!("{msg}\n")).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) | StoreError::MissingCommit(_) | StoreError::MissingBranch(_) => {
                ApiError::NotFound(e.to_string())
            }
            StoreError::BranchExists(_)
            | StoreError::NameTaken(_)
            | StoreError::MissingParent(_) => ApiError::Conflict(e.to_string()),
            StoreError::ReadOnly(_) => ApiError::BadRequest(e.to_string()),
            StoreError::Corrupt(..) | StoreError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Timeout { .. } => ApiError::Timeout(e.to_string()),
            PipelineError::Store(inner) => inner.into(),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<ReplicaError> for ApiError {
    fn from(e: ReplicaError) -> Self {
        match e {
            ReplicaError::Store(inner) => inner.into(),
            ReplicaError::Multipart(_) | ReplicaError::BadDelta(..) => {
                ApiError::BadRequest(e.to_string())
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Params {
    branch: Option<String>,
    commit: Option<String>,
    shard: Option<String>,
    from: Option<String>,
}

impl Params {
    fn branch_or_default(&self) -> &str {
        self.branch.as_deref().unwrap_or(DEFAULT_REF)
    }

    /// Reads with no commit resolve to the branch head named `master`,
    /// which intentionally serves its unsealed state.
    fn commit_or_default(&self) -> &str {
        self.commit.as_deref().unwrap_or(DEFAULT_REF)
    }

    fn shard_filter(&self) -> Result<Option<ShardSpec>, ApiError> {
        match &self.shard {
            None => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|e: crate::route::RouteError| ApiError::BadRequest(e.to_string())),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotMsg {
    name: String,
    t_stamp: String,
}

async fn ping() -> &'static str {
    "pong\n"
}

/// Newline-delimited JSON of sealed commits, newest first.
async fn list_commits(State(shard): State<Arc<Shard>>) -> Result<String, ApiError> {
    snapshot_listing(&shard, true).await
}

/// Newline-delimited JSON of writable branches.
async fn list_branches(State(shard): State<Arc<Shard>>) -> Result<String, ApiError> {
    snapshot_listing(&shard, false).await
}

async fn snapshot_listing(shard: &Shard, sealed: bool) -> Result<String, ApiError> {
    let names = if sealed {
        shard
            .store
            .commits(&shard.data_repo, None, Order::Desc)
            .await?
    } else {
        shard.store.branches(&shard.data_repo).await?
    };
    let mut out = String::new();
    for name in names {
        let stat = shard
            .store
            .stat(&format!("{}/{name}", shard.data_repo))
            .await?;
        let msg = SnapshotMsg {
            name: stat.name,
            t_stamp: stat.modified.format(TSTAMP_FORMAT).to_string(),
        };
        let line = serde_json::to_string(&msg).map_err(|e| ApiError::Internal(e.to_string()))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// POST /commit does double duty: with an empty body it seals the branch
/// head and swaps in a pipeline runner; with a multipart body it applies a
/// peer's pull stream as a push.
async fn post_commit(
    State(shard): State<Arc<Shard>>,
    Query(params): Query<Params>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if body.is_empty() {
        let name = shard
            .commit_local(params.branch_or_default(), params.commit.clone())
            .await?;
        return Ok(format!("{name}\n").into_response());
    }

    let boundary = headers
        .get("Boundary")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(multipart::boundary_from_content_type)
        })
        .ok_or_else(|| ApiError::BadRequest("missing multipart boundary".to_string()))?;
    let replica = LocalReplica::new(shard.store.clone(), shard.data_repo.clone());
    let created = replica.push(&body, &boundary).await?;
    tracing::info!(created, "applied pushed commits");
    Ok(StatusCode::OK.into_response())
}

async fn create_branch(
    State(shard): State<Arc<Shard>>,
    Query(params): Query<Params>,
) -> Result<String, ApiError> {
    let commit = params.commit_or_default();
    let branch = params.branch_or_default();
    shard
        .store
        .branch(&shard.data_repo, Some(commit), branch)
        .await?;
    Ok(format!("Created branch. ({commit}) -> {branch}.\n"))
}

async fn upload_manifest(
    State(shard): State<Arc<Shard>>,
    Path(name): Path<String>,
    Query(params): Query<Params>,
    body: Bytes,
) -> Result<String, ApiError> {
    let rel = format!("{}/{name}", crate::pipeline::MANIFEST_DIR);
    let path = format!(
        "{}/{}/{rel}",
        shard.data_repo,
        params.branch_or_default()
    );
    let mut reader = body.as_ref();
    let size = shard.store.create_from_reader(&path, &mut reader).await?;
    Ok(format!("Created {rel}, size: {size}.\n"))
}

/// Multipart stream of snapshot deltas newer than `from`. The boundary is
/// published in the `Boundary` response header.
async fn pull(
    State(shard): State<Arc<Shard>>,
    Query(params): Query<Params>,
) -> Result<Response, ApiError> {
    if let Some(from) = &params.from {
        let known = shard
            .store
            .is_commit(&format!("{}/{from}", shard.data_repo))
            .await?;
        if !known {
            return Err(ApiError::NotFound(format!("missing commit: {from}")));
        }
    }
    let boundary = multipart::new_boundary();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let replica = LocalReplica::new(shard.store.clone(), shard.data_repo.clone());
    let from = params.from.clone();
    {
        let boundary = boundary.clone();
        tokio::spawn(async move {
            if let Err(e) = replica.pull(from.as_deref(), &boundary, tx).await {
                tracing::error!(error = %e, "pull stream aborted");
            }
        });
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Boundary", boundary.as_str())
        .header(header::CONTENT_TYPE, multipart::content_type(&boundary))
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Fallback for every URL carrying a `file` segment. The segments before
/// `file` pick the snapshot root; the segments after it name the path
/// inside that snapshot.
async fn dispatch_files(
    State(shard): State<Arc<Shard>>,
    method: Method,
    uri: Uri,
    Query(params): Query<Params>,
    body: Bytes,
) -> Response {
    match route_file_request(&shard, &method, &uri, &params, body).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn route_file_request(
    shard: &Arc<Shard>,
    method: &Method,
    uri: &Uri,
    params: &Params,
    body: Bytes,
) -> Result<Response, ApiError> {
    let segments: Vec<&str> = uri.path().split('/').filter(|s| !s.is_empty()).collect();
    let file_at = segments.iter().position(|s| *s == "file");
    let Some(file_at) = file_at else {
        return Err(ApiError::NotFound("404 page not found".to_string()));
    };
    let rel = segments[file_at + 1..].join("/");

    let root = match &segments[..file_at] {
        // Mutations land on the branch head, reads on the named commit.
        [] => match *method {
            Method::GET => format!("{}/{}", shard.data_repo, params.commit_or_default()),
            _ => format!("{}/{}", shard.data_repo, params.branch_or_default()),
        },
        ["commit", commit] => {
            if *method != Method::GET {
                return Err(ApiError::MethodNotAllowed(format!(
                    "{method} not allowed on a sealed commit"
                )));
            }
            format!("{}/{commit}", shard.data_repo)
        }
        ["branch", branch] => format!("{}/{branch}", shard.data_repo),
        ["pipeline", pipeline] => {
            if *method != Method::GET {
                return Err(ApiError::MethodNotAllowed(format!(
                    "{method} not allowed on pipeline output"
                )));
            }
            let commit = params.commit_or_default();
            wait_pipeline(
                &shard.store,
                &shard.failures,
                &shard.pipeline_prefix,
                pipeline,
                commit,
                shard.wait_timeout,
                shard.poll_interval,
            )
            .await?;
            format!("{}/{pipeline}/{commit}", shard.pipeline_prefix)
        }
        _ => return Err(ApiError::NotFound("404 page not found".to_string())),
    };

    match *method {
        Method::GET => serve_files(shard, &root, &rel, params.shard_filter()?).await,
        Method::POST => {
            let mut reader = body.as_ref();
            let size = shard
                .store
                .create_from_reader(&format!("{root}/{rel}"), &mut reader)
                .await?;
            Ok(format!("Created {rel}, size: {size}.\n").into_response())
        }
        Method::PUT => {
            let mut reader = body.as_ref();
            let size = shard
                .store
                .copy_file(&format!("{root}/{rel}"), &mut reader)
                .await?;
            Ok(format!("Created {rel}, size: {size}.\n").into_response())
        }
        Method::DELETE => {
            shard.store.remove(&format!("{root}/{rel}")).await?;
            Ok(format!("Deleted {rel}.\n").into_response())
        }
        _ => Err(ApiError::MethodNotAllowed(format!(
            "{method} not supported for files"
        ))),
    }
}

/// GET on a file path. The raw glob count picks the response shape: one
/// match streams the file, several stream a multipart body with
/// directories elided and the shard filter applied per entry.
async fn serve_files(
    shard: &Arc<Shard>,
    root: &str,
    rel: &str,
    filter: Option<ShardSpec>,
) -> Result<Response, ApiError> {
    let pattern = if rel.is_empty() {
        format!("{root}/*")
    } else {
        format!("{root}/{rel}")
    };
    let entries = shard.store.glob(&pattern).await?;
    match entries.as_slice() {
        [] => Err(ApiError::NotFound(format!("no files match {pattern}"))),
        [single] => {
            let stat = shard.store.stat(single).await?;
            if stat.is_dir {
                // A lone directory serves its children as multipart.
                let children = shard.store.glob(&format!("{single}/*")).await?;
                if children.is_empty() {
                    return Err(ApiError::NotFound(format!("no files under {single}")));
                }
                multipart_response(shard, root, children, filter)
            } else {
                let reader = shard.store.open(single).await?;
                Ok(Body::from_stream(reader_stream(reader)).into_response())
            }
        }
        _ => multipart_response(shard, root, entries, filter),
    }
}

fn multipart_response(
    shard: &Arc<Shard>,
    root: &str,
    entries: Vec<String>,
    filter: Option<ShardSpec>,
) -> Result<Response, ApiError> {
    let boundary = multipart::new_boundary();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let store = shard.store.clone();
    let prefix = format!("{root}/");
    {
        let boundary = boundary.clone();
        tokio::spawn(async move {
            if let Err(e) = write_parts(&store, &prefix, &entries, filter, &boundary, &tx).await {
                tracing::warn!(error = %e, "multipart response aborted");
                let _ = tx.send(Err(e)).await;
            }
        });
    }
    Response::builder()
        .status(StatusCode::OK)
        .header("Boundary", boundary.as_str())
        .header(header::CONTENT_TYPE, multipart::content_type(&boundary))
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))
}

async fn write_parts(
    store: &Arc<dyn SnapshotStore>,
    prefix: &str,
    entries: &[String],
    filter: Option<ShardSpec>,
    boundary: &str,
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), std::io::Error> {
    for entry in entries {
        let stat = store.stat(entry).await.map_err(std::io::Error::other)?;
        if stat.is_dir {
            continue;
        }
        let name = entry.strip_prefix(prefix).unwrap_or(entry);
        if let Some(spec) = filter {
            if !spec.matches(name) {
                continue;
            }
        }
        if tx
            .send(Ok(multipart::part_header(boundary, name)))
            .await
            .is_err()
        {
            return Ok(());
        }
        let mut reader = store.open(entry).await.map_err(std::io::Error::other)?;
        pump(reader.as_mut(), tx).await?;
        if tx.send(Ok(multipart::part_trailer())).await.is_err() {
            return Ok(());
        }
    }
    let _ = tx.send(Ok(multipart::close_delimiter(boundary))).await;
    Ok(())
}

async fn pump(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    tx: &mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), std::io::Error> {
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
            return Ok(());
        }
    }
}

fn reader_stream(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
) -> ReceiverStream<Result<Bytes, std::io::Error>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        if let Err(e) = pump(reader.as_mut(), &tx).await {
            let _ = tx.send(Err(e)).await;
        }
    });
    ReceiverStream::new(rx)
}
