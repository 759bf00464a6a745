//!
//! hyperfs HTTP/WebDAV server
//! --------------------------
//! Axum-based HTTP API exposing the JSON control surface and a WebDAV
//! adapter over the same virtual namespace.
//!
//! Responsibilities:
//! - Mounting the JSON control routes and the WebDAV method set on one
//!   `Router`, sharing one `AppState`.
//! - Building the file service (catalog + blob store + tmp arena) from
//!   `Settings` and running the startup GC sweep before accepting traffic.
//! - Translating `AppError` into HTTP responses via `IntoResponse`.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, MatchedPath, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use tracing::info;

use crate::config::Settings;
use crate::gc;
use crate::service::FileService;

pub mod range;
pub mod routes;
pub mod webdav;

/// Request bodies aggregated into memory (JSON control endpoints) are
/// capped per the resource budget; streamed uploads opt out of this via
/// `DefaultBodyLimit::disable()` on their own routes.
const METADATA_BODY_LIMIT: usize = 6 * 1024 * 1024 + 512 * 1024; // 6.5 MiB

/// Logs every request's method, matched route and outcome status in one
/// shared layer instead of repeating the same call at every handler.
async fn trace_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let start = Instant::now();
    let response = next.run(req).await;
    tracing::debug!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub files: FileService,
}

/// Builds the catalog, runs the startup GC sweep, and mounts the full
/// route table. Returns an unbound `Router` so tests can drive it with
/// `tower::ServiceExt::oneshot` without a live TCP listener.
pub fn build_app(settings: &Settings) -> anyhow::Result<Router> {
    settings.ensure_dirs()?;
    let catalog = crate::catalog::Catalog::open(&settings.db_path)?;

    let report = gc::gc_apply(&catalog, &settings.data_dir)?;
    info!(
        orphans_deleted = report.orphan_files_deleted,
        missing_blobs = report.missing_blobs_found,
        "startup gc complete"
    );

    let files = FileService::new(catalog, settings.data_dir.clone(), settings.tmp_dir.clone());
    let state = AppState { files };

    let app = Router::new()
        .merge(routes::router())
        .merge(webdav::router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(METADATA_BODY_LIMIT))
        .layer(middleware::from_fn(trace_requests));
    Ok(app)
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let app = build_app(&settings)?;
    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(%addr, "starting hyperfs server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_settings() -> (Settings, tempfile::TempDir) {
        let root = tempfile::tempdir().unwrap();
        let settings = Settings::new(
            0,
            root.path().join("blobs"),
            root.path().join("tmp"),
            root.path().join("hyperfs.db"),
        )
        .unwrap();
        (settings, root)
    }

    #[tokio::test]
    async fn root_list_returns_empty_directory() {
        let (settings, _root) = test_settings();
        let app = build_app(&settings).unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/list?path=/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
