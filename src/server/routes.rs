//! JSON control endpoints: `/list`, `/download`, `/upload`, `/delete`,
//! `/folder`, `/move`, `/rename`, `/copy`.

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::catalog::Node;
use crate::error::AppError;
use crate::service::ConflictStrategy;

use super::range::{parse_range, RangeOutcome};
use super::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/list", get(list))
        .route("/download", get(download).head(download))
        // Streamed uploads are unbounded per the resource budget; the
        // crate-wide metadata body cap applied in `server::build_app`
        // would otherwise also clamp file bodies here.
        .route(
            "/upload",
            post(upload).route_layer(DefaultBodyLimit::disable()),
        )
        .route("/delete", post(delete))
        .route("/folder", post(create_folder))
        .route("/move", post(move_node))
        .route("/rename", post(rename))
        .route("/copy", post(copy_node))
}

#[derive(Debug, Serialize)]
struct NodeView {
    id: i64,
    #[serde(rename = "parentId")]
    parent_id: i64,
    name: String,
    #[serde(rename = "isFolder")]
    is_folder: bool,
    digest: Option<String>,
    size: u64,
    #[serde(rename = "uploadTime")]
    upload_time: i64,
    #[serde(rename = "downloadCount")]
    download_count: i64,
}

impl From<Node> for NodeView {
    fn from(n: Node) -> Self {
        NodeView {
            id: n.id,
            parent_id: n.parent_id,
            name: n.name,
            is_folder: n.kind.is_directory(),
            digest: n.digest.map(|d| d.to_string()),
            size: n.size,
            upload_time: n.upload_time,
            download_count: n.download_count,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(rename = "parentId", default)]
    parent_id: i64,
}

async fn list(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<NodeView>>, AppError> {
    let children = state.files.list_children(q.parent_id).await?;
    Ok(Json(children.into_iter().map(NodeView::from).collect()))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    id: i64,
}

fn content_disposition(name: &str) -> HeaderValue {
    let encoded = urlencoding::encode(name);
    HeaderValue::from_str(&format!("attachment; filename*=UTF-8''{encoded}"))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn download(
    State(state): State<AppState>,
    Query(q): Query<DownloadQuery>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let descriptor = state.files.prepare_download(q.id).await?;

    let range_outcome = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(|v| parse_range(v, descriptor.size))
        .unwrap_or(RangeOutcome::Full);

    let (status, range_header, content_length, skip, take) = match range_outcome {
        RangeOutcome::NotSatisfiable => {
            return Err(AppError::RangeNotSatisfiable {
                size: descriptor.size,
            })
        }
        RangeOutcome::Full => (StatusCode::OK, None, descriptor.size, 0u64, descriptor.size),
        RangeOutcome::Satisfiable(r) => (
            StatusCode::PARTIAL_CONTENT,
            Some(format!("bytes {}-{}/{}", r.start, r.end, descriptor.size)),
            r.len(),
            r.start,
            r.len(),
        ),
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_DISPOSITION, content_disposition(&descriptor.name));
    if let Some(range) = range_header {
        builder = builder.header(header::CONTENT_RANGE, range);
    }

    if method == Method::HEAD {
        return Ok(builder.body(Body::empty()).unwrap());
    }

    let mut file = tokio::fs::File::open(&descriptor.path).await?;
    if skip > 0 {
        use tokio::io::AsyncSeekExt;
        file.seek(std::io::SeekFrom::Start(skip)).await?;
    }
    let limited = file.take(take);
    let stream = ReaderStream::new(limited);
    Ok(builder.body(Body::from_stream(stream)).unwrap())
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    #[serde(rename = "parentId", default)]
    parent_id: i64,
    filename: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    id: i64,
    digest: String,
    size: u64,
    duplicate: bool,
}

async fn upload(
    State(state): State<AppState>,
    Query(q): Query<UploadQuery>,
    body: Body,
) -> Result<Json<UploadResponse>, AppError> {
    if q.filename.trim().is_empty() {
        return Err(AppError::BadRequest("filename must not be empty".into()));
    }
    let mut session = state.files.begin_upload();
    session.start().await?;

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::TransportError(format!("body stream: {e}")))?;
        if let Err(e) = session.process_chunk(&chunk).await {
            session.abort().await;
            return Err(e);
        }
    }

    let finished = match session.finish().await {
        Ok(f) => f,
        Err(e) => {
            session.abort().await;
            return Err(e);
        }
    };

    let result = state
        .files
        .upload_commit(q.parent_id, q.filename, finished)
        .await?;
    Ok(Json(UploadResponse {
        id: result.node_id,
        digest: result.digest.to_string(),
        size: result.size,
        duplicate: result.duplicate,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    id: i64,
}

async fn delete(
    State(state): State<AppState>,
    Query(q): Query<DeleteQuery>,
) -> Result<StatusCode, AppError> {
    state.files.delete_node(q.id).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct FolderQuery {
    #[serde(rename = "parentId", default)]
    parent_id: i64,
    name: String,
}

#[derive(Debug, Serialize)]
struct FolderResponse {
    id: i64,
}

async fn create_folder(
    State(state): State<AppState>,
    Query(q): Query<FolderQuery>,
) -> Result<Json<FolderResponse>, AppError> {
    let id = state.files.create_folder(q.parent_id, q.name).await?;
    Ok(Json(FolderResponse { id }))
}

#[derive(Debug, Deserialize)]
struct MovePayload {
    id: i64,
    #[serde(rename = "targetParentId")]
    target_parent_id: i64,
    strategy: Option<String>,
}

async fn move_node(
    State(state): State<AppState>,
    Json(payload): Json<MovePayload>,
) -> Result<Json<NodeView>, AppError> {
    let strategy = ConflictStrategy::parse(payload.strategy.as_deref());
    let node = state
        .files
        .move_node(payload.id, payload.target_parent_id, strategy)
        .await?;
    Ok(Json(NodeView::from(node)))
}

#[derive(Debug, Deserialize)]
struct RenamePayload {
    id: i64,
    name: String,
}

async fn rename(
    State(state): State<AppState>,
    Json(payload): Json<RenamePayload>,
) -> Result<Json<NodeView>, AppError> {
    state
        .files
        .catalog
        .with_tx(move |tx| crate::catalog::node::rename(tx, payload.id, &payload.name))
        .await?;
    let node = state.files.get_node(payload.id).await?;
    Ok(Json(NodeView::from(node)))
}

#[derive(Debug, Deserialize)]
struct CopyPayload {
    id: i64,
    #[serde(rename = "targetParentId")]
    target_parent_id: i64,
    strategy: Option<String>,
}

#[derive(Debug, Serialize)]
struct CopyResponse {
    id: i64,
}

async fn copy_node(
    State(state): State<AppState>,
    Json(payload): Json<CopyPayload>,
) -> Result<Json<CopyResponse>, AppError> {
    let strategy = ConflictStrategy::parse(payload.strategy.as_deref());
    let new_id = state
        .files
        .copy_node(payload.id, payload.target_parent_id, strategy)
        .await?;
    Ok(Json(CopyResponse { id: new_id }))
}

