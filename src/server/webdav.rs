//! WebDAV adapter: `OPTIONS`, `PROPFIND`, `MKCOL`, `PUT`, `GET`, `DELETE`,
//! `COPY`, `MOVE` under `/webdav/<path>`, with path resolution by name
//! rather than numeric id.

use std::io::Cursor;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path as AxumPath, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::StreamExt;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tokio_util::io::ReaderStream;

use crate::catalog::Node;
use crate::error::AppError;
use crate::service::ConflictStrategy;

use super::AppState;

pub fn router() -> Router<AppState> {
    // PUT bodies are streamed file content and must stay unbounded; see the
    // matching note on `/upload` in `routes.rs`.
    Router::new()
        .route("/webdav/{*path}", any(dispatch))
        .route_layer(DefaultBodyLimit::disable())
}

fn split_parent_and_name(path: &str) -> (String, String) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => (format!("/{parent}"), name.to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

/// Strips a leading `/webdav` prefix and any scheme+host, then URL-decodes.
fn normalize_destination(raw: &str) -> String {
    let without_origin = if let Some(idx) = raw.find("://") {
        raw[idx + 3..].find('/').map(|i| &raw[idx + 3 + i..]).unwrap_or("/")
    } else {
        raw
    };
    let decoded = urlencoding::decode(without_origin)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| without_origin.to_string());
    decoded.strip_prefix("/webdav").unwrap_or(&decoded).to_string()
}

fn overwrite_strategy(headers: &HeaderMap) -> ConflictStrategy {
    match headers
        .get("Overwrite")
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_uppercase)
        .as_deref()
    {
        Some("T") => ConflictStrategy::Overwrite,
        _ => ConflictStrategy::Fail,
    }
}

fn depth(headers: &HeaderMap) -> u8 {
    match headers.get("Depth").and_then(|v| v.to_str().ok()) {
        Some("0") => 0,
        _ => 1,
    }
}

async fn dispatch(
    State(state): State<AppState>,
    AxumPath(raw_path): AxumPath<String>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let path = format!("/{raw_path}");
    let result = match method.as_str() {
        "OPTIONS" => return options_response(),
        "PROPFIND" => propfind(&state, &path, depth(&headers)).await,
        "MKCOL" => mkcol(&state, &path).await,
        "PUT" => put(&state, &path, body).await,
        "GET" | "HEAD" => get(&state, &path, method == Method::HEAD).await,
        "DELETE" => delete(&state, &path).await,
        "COPY" => copy(&state, &path, &headers).await,
        "MOVE" => r#move(&state, &path, &headers).await,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    result.unwrap_or_else(webdav_error_response)
}

/// WebDAV responses carry only a status code on failure, never the JSON
/// routes' `Error: <message>` text line.
fn webdav_error_response(err: AppError) -> Response {
    Response::builder()
        .status(err.status())
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn options_response() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("DAV", "1")
        .header(
            header::ALLOW,
            "OPTIONS, PROPFIND, MKCOL, PUT, GET, HEAD, DELETE, COPY, MOVE",
        )
        .body(Body::empty())
        .unwrap()
}

async fn mkcol(state: &AppState, path: &str) -> Result<Response, AppError> {
    let (parent_path, name) = split_parent_and_name(path);
    let parent = state.files.resolve(parent_path).await?;
    state.files.create_folder(parent.id, name).await?;
    Ok(StatusCode::CREATED.into_response())
}

async fn put(state: &AppState, path: &str, body: Body) -> Result<Response, AppError> {
    let (parent_path, name) = split_parent_and_name(path);
    if name.is_empty() {
        return Err(AppError::BadRequest("PUT target has no filename".into()));
    }
    let parent = state.files.resolve(parent_path).await?;

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
    let existed = state
        .files
        .catalog
        .get_by_parent_and_name(parent.id, name.clone())
        .await?
        .is_some();
    state.files.upload_commit(parent.id, name, finished).await?;
    Ok(if existed {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::CREATED.into_response()
    })
}

async fn get(state: &AppState, path: &str, head_only: bool) -> Result<Response, AppError> {
    let node = state.files.resolve(path.to_string()).await?;
    if node.kind.is_directory() {
        return Err(AppError::IsDirectory(path.to_string()));
    }
    let descriptor = state.files.prepare_download(node.id).await?;
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, descriptor.size)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if head_only {
        return Ok(builder.body(Body::empty()).unwrap());
    }
    let file = tokio::fs::File::open(&descriptor.path).await?;
    let stream = ReaderStream::new(file);
    Ok(builder.body(Body::from_stream(stream)).unwrap())
}

async fn delete(state: &AppState, path: &str) -> Result<Response, AppError> {
    let node = state.files.resolve(path.to_string()).await?;
    state.files.delete_node(node.id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `Destination`'s basename is only used to find the target directory;
/// the moved/copied node keeps its own name there (conflicts are still
/// resolved per `Overwrite`). Renaming to a different basename is only
/// exposed through the JSON `/rename` endpoint.
fn destination_parent(headers: &HeaderMap, what: &str) -> Result<String, AppError> {
    let destination = headers
        .get("Destination")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest(format!("{what} requires a Destination header")))?;
    Ok(split_parent_and_name(&normalize_destination(destination)).0)
}

async fn copy(state: &AppState, path: &str, headers: &HeaderMap) -> Result<Response, AppError> {
    let source = state.files.resolve(path.to_string()).await?;
    let parent_path = destination_parent(headers, "COPY")?;
    let target_parent = state.files.resolve(parent_path).await?;
    let strategy = overwrite_strategy(headers);
    state
        .files
        .copy_node(source.id, target_parent.id, strategy)
        .await?;
    Ok(StatusCode::CREATED.into_response())
}

async fn r#move(state: &AppState, path: &str, headers: &HeaderMap) -> Result<Response, AppError> {
    let source = state.files.resolve(path.to_string()).await?;
    let parent_path = destination_parent(headers, "MOVE")?;
    let target_parent = state.files.resolve(parent_path).await?;
    let strategy = overwrite_strategy(headers);
    state
        .files
        .move_node(source.id, target_parent.id, strategy)
        .await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn propfind(state: &AppState, path: &str, depth: u8) -> Result<Response, AppError> {
    let node = state.files.resolve(path.to_string()).await?;
    let mut entries = vec![(path.trim_end_matches('/').to_string(), node.clone())];
    if depth == 1 && node.kind.is_directory() {
        for child in state.files.list_children(node.id).await? {
            let child_path = format!("{}/{}", path.trim_end_matches('/'), child.name);
            entries.push((child_path, child));
        }
    }
    let xml = render_multistatus(&entries);
    Ok(Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header(header::CONTENT_TYPE, HeaderValue::from_static("application/xml; charset=utf-8"))
        .body(Body::from(xml))
        .unwrap())
}

fn rfc1123(millis: i64) -> String {
    use chrono::{DateTime, Utc};
    let dt = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn iso8601(millis: i64) -> String {
    use chrono::{DateTime, Utc};
    let dt = DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default();
    dt.to_rfc3339()
}

fn render_multistatus(entries: &[(String, Node)]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut writer = Writer::new(Cursor::new(&mut buf));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .ok();

    let mut multistatus = BytesStart::new("D:multistatus");
    multistatus.push_attribute(("xmlns:D", "DAV:"));
    writer.write_event(Event::Start(multistatus)).ok();

    for (href, node) in entries {
        write_response(&mut writer, href, node);
    }

    writer
        .write_event(Event::End(BytesEnd::new("D:multistatus")))
        .ok();
    buf
}

fn write_text(writer: &mut Writer<Cursor<&mut Vec<u8>>>, tag: &str, text: &str) {
    writer.write_event(Event::Start(BytesStart::new(tag))).ok();
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .ok();
    writer.write_event(Event::End(BytesEnd::new(tag))).ok();
}

fn write_response(writer: &mut Writer<Cursor<&mut Vec<u8>>>, href: &str, node: &Node) {
    writer
        .write_event(Event::Start(BytesStart::new("D:response")))
        .ok();
    write_text(writer, "D:href", href);

    writer
        .write_event(Event::Start(BytesStart::new("D:propstat")))
        .ok();
    writer
        .write_event(Event::Start(BytesStart::new("D:prop")))
        .ok();

    write_text(writer, "D:displayname", &node.name);

    writer
        .write_event(Event::Start(BytesStart::new("D:resourcetype")))
        .ok();
    if node.kind.is_directory() {
        writer
            .write_event(Event::Empty(BytesStart::new("D:collection")))
            .ok();
    }
    writer
        .write_event(Event::End(BytesEnd::new("D:resourcetype")))
        .ok();

    if !node.kind.is_directory() {
        write_text(writer, "D:getcontentlength", &node.size.to_string());
    }
    write_text(writer, "D:getlastmodified", &rfc1123(node.upload_time));
    write_text(writer, "D:creationdate", &iso8601(node.upload_time));

    writer
        .write_event(Event::End(BytesEnd::new("D:prop")))
        .ok();
    write_text(writer, "D:status", "HTTP/1.1 200 OK");
    writer
        .write_event(Event::End(BytesEnd::new("D:propstat")))
        .ok();

    writer
        .write_event(Event::End(BytesEnd::new("D:response")))
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_strips_origin_and_webdav_prefix() {
        assert_eq!(
            normalize_destination("http://example.com/webdav/a/b.txt"),
            "/a/b.txt"
        );
        assert_eq!(normalize_destination("/webdav/a/b%20c.txt"), "/a/b c.txt");
    }

    #[test]
    fn split_parent_and_name_handles_root_level() {
        assert_eq!(split_parent_and_name("/a.txt"), ("/".to_string(), "a.txt".to_string()));
        assert_eq!(
            split_parent_and_name("/dir/a.txt"),
            ("/dir".to_string(), "a.txt".to_string())
        );
    }
}
