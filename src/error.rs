//! Unified application error model and its mapping to HTTP/WebDAV status codes.
//!
//! One enum is shared across the blob store, catalog, upload pipeline and
//! HTTP/WebDAV adapter so the adapter can map errors to status codes without
//! string matching.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("bad target: {0}")]
    BadTarget(String),

    #[error("name conflict: {0}")]
    NameConflict(String),

    #[error("move would create a cycle: {0}")]
    CycleForbidden(String),

    #[error("digest collision for {digest}: existing size {existing_size}, new size {new_size}")]
    DigestCollision {
        digest: String,
        existing_size: u64,
        new_size: u64,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("blob missing on disk for digest {0}")]
    MissingBlob(String),

    #[error("range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("transport error: {0}")]
    TransportError(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::IsDirectory(_) | AppError::BadTarget(_) => StatusCode::BAD_REQUEST,
            AppError::NameConflict(_) => StatusCode::CONFLICT,
            AppError::CycleForbidden(_) => StatusCode::CONFLICT,
            AppError::DigestCollision { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::InvariantViolation(_) | AppError::MissingBlob(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::TransportError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::TransportError(format!("sqlite: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::TransportError(format!("io: {err}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::RangeNotSatisfiable { size } = &self {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header("Content-Range", format!("bytes */{size}"))
                .body(axum::body::Body::empty())
                .unwrap_or_else(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response());
        }
        let status = self.status();
        (status, format!("Error: {self}\n")).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            AppError::BadRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::NameConflict("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::CycleForbidden("x".into()).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::DigestCollision {
                digest: "d".into(),
                existing_size: 1,
                new_size: 2
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            AppError::RangeNotSatisfiable { size: 10 }.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }
}
