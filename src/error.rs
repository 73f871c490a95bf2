//! 上传错误分类与统一的 API 错误响应。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// 上传流程中的错误（面向领域，带结构化上下文）。
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("missing required field `{field}`")]
    MalformedRequest { field: &'static str },
    #[error(transparent)]
    PayloadRejected(#[from] RejectReason),
    #[error("chunk index {index} is outside 0..{total}")]
    InvalidChunkIndex { index: u64, total: u64 },
    #[error("upload session `{session_id}` not found")]
    SessionNotFound { session_id: String },
    #[error("upload session `{session_id}` incomplete ({received}/{total} chunks)")]
    IncompleteSession {
        session_id: String,
        received: u64,
        total: u64,
    },
    #[error("too many uploads in progress (limit {limit})")]
    TooManySessions { limit: u64 },
    #[error(transparent)]
    BackendUnavailable(#[from] BackendFailure),
}

/// 在写入任何存储之前拒绝的负载。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("only PDF files are allowed (got `{received}`)")]
    UnsupportedType { received: String },
    #[error("file too large ({}). Maximum is {}.", megabytes(.size), megabytes(.limit))]
    TooLarge { size: u64, limit: u64 },
    #[error("chunk too large ({size} bytes, limit {limit})")]
    ChunkTooLarge { size: u64, limit: u64 },
    #[error("too many chunks ({declared}, limit {limit})")]
    TooManyChunks { declared: u64, limit: u64 },
}

/// 远端存储失败。
#[derive(Debug, Error)]
pub enum BackendFailure {
    #[error("remote store timed out")]
    Timeout,
    #[error("remote store rejected credentials: {0}")]
    Unauthorized(String),
    #[error("remote store quota exceeded: {0}")]
    Quota(String),
    #[error("remote store failure ({status:?}): {message}")]
    Unexpected {
        status: Option<u16>,
        message: String,
    },
}

impl UploadError {
    /// 错误类别标签，随响应返回给客户端。
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::MalformedRequest { .. } => "malformed_request",
            UploadError::PayloadRejected(_) => "payload_rejected",
            UploadError::InvalidChunkIndex { .. } => "invalid_chunk_index",
            UploadError::SessionNotFound { .. } => "session_not_found",
            UploadError::IncompleteSession { .. } => "incomplete_session",
            UploadError::TooManySessions { .. } => "too_many_sessions",
            UploadError::BackendUnavailable(_) => "backend_unavailable",
        }
    }
}

/// 以 MB 为单位格式化字节数，保留一位小数。
pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.1} MB", bytes as f64 / 1024.0 / 1024.0)
}

fn megabytes(bytes: &u64) -> String {
    format_megabytes(*bytes)
}

pub enum ApiError {
    BadRequest(&'static str, String),
    Unauthorized(HeaderMap),
    NotFound(String),
    PayloadTooLarge(String),
    /// 重试秒数、错误类别与说明。
    TooManyRequests(u64, &'static str, String),
    GatewayTimeout(String),
    Internal(&'static str, String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    kind: &'a str,
}

fn error_response(status: StatusCode, headers: HeaderMap, kind: &str, message: &str) -> Response {
    (
        status,
        headers,
        JsonResponse(ErrorBody {
            error: message,
            kind,
        }),
    )
        .into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(kind, msg) => {
                error_response(StatusCode::BAD_REQUEST, HeaderMap::new(), kind, &msg)
            }
            ApiError::Unauthorized(headers) => {
                error_response(StatusCode::UNAUTHORIZED, headers, "unauthorized", "unauthorized")
            }
            ApiError::NotFound(msg) => {
                error_response(StatusCode::NOT_FOUND, HeaderMap::new(), "not_found", &msg)
            }
            ApiError::PayloadTooLarge(msg) => error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                HeaderMap::new(),
                "payload_rejected",
                &msg,
            ),
            ApiError::TooManyRequests(retry_after, kind, msg) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                error_response(StatusCode::TOO_MANY_REQUESTS, headers, kind, &msg)
            }
            ApiError::GatewayTimeout(msg) => error_response(
                StatusCode::GATEWAY_TIMEOUT,
                HeaderMap::new(),
                "backend_unavailable",
                &msg,
            ),
            ApiError::Internal(kind, msg) => {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), kind, &msg)
            }
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        let kind = error.kind();
        let message = error.to_string();
        match error {
            UploadError::PayloadRejected(
                RejectReason::TooLarge { .. } | RejectReason::ChunkTooLarge { .. },
            ) => ApiError::PayloadTooLarge(message),
            UploadError::TooManySessions { .. } => ApiError::TooManyRequests(60, kind, message),
            UploadError::BackendUnavailable(BackendFailure::Timeout) => {
                ApiError::GatewayTimeout(message)
            }
            UploadError::BackendUnavailable(_) => ApiError::Internal(kind, message),
            _ => ApiError::BadRequest(kind, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn size_rejections_map_to_413() {
        let error = UploadError::from(RejectReason::TooLarge {
            size: 60 * 1024 * 1024,
            limit: 50 * 1024 * 1024,
        });
        assert_eq!(error.to_string(), "file too large (60.0 MB). Maximum is 50.0 MB.");
        let response = ApiError::from(error).into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn protocol_violations_map_to_400() {
        let response =
            ApiError::from(UploadError::InvalidChunkIndex { index: 5, total: 3 }).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::from(UploadError::PayloadRejected(
            RejectReason::UnsupportedType {
                received: "text/plain".into(),
            },
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn backend_failures_are_classified() {
        let timeout = ApiError::from(UploadError::from(BackendFailure::Timeout)).into_response();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let quota = ApiError::from(UploadError::from(BackendFailure::Quota("daily".into())))
            .into_response();
        assert_eq!(quota.status(), StatusCode::INTERNAL_SERVER_ERROR);

    }

    #[tokio::test]
    async fn session_limit_keeps_kind_and_message() {
        let busy = ApiError::from(UploadError::TooManySessions { limit: 2 }).into_response();
        assert_eq!(busy.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(busy.headers()[header::RETRY_AFTER], "60");

        let body = busy
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).expect("json body");
        assert_eq!(body["kind"], "too_many_sessions");
        assert_eq!(body["error"], "too many uploads in progress (limit 2)");
    }
}
