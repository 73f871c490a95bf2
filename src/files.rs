//! 已完成文件的读取：内联展示、Range 请求与缓存相关头。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use httpdate::fmt_http_date;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

use crate::artifact::{Artifact, ArtifactStore};
use crate::error::ApiError;

const CACHE_CONTROL: &str = "public, max-age=3600";

/// 按 id 返回文件内容（`/api/file/{id}` 与 `/api/view/{id}`）。
pub async fn serve_artifact(
    Path(id): Path<String>,
    request_headers: HeaderMap,
    Extension(store): Extension<Arc<ArtifactStore>>,
) -> Result<Response, ApiError> {
    let artifact = store
        .get(&id)
        .await
        .ok_or_else(|| ApiError::NotFound("File not found or expired".into()))?;

    let size = artifact.byte_length();
    let etag = etag_for(&artifact);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CONTENT_TYPE, header_value(&artifact.mime_type)?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(&artifact.file_name))?,
    );
    response_headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(header::ETAG, header_value(&etag)?);
    response_headers.insert(
        header::LAST_MODIFIED,
        header_value(&fmt_http_date(SystemTime::from(artifact.uploaded_at)))?,
    );
    response_headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));

    if if_none_match(&request_headers, &etag) {
        debug!(file_id = id, "artifact not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let if_range_matches = request_headers
        .get(header::IF_RANGE)
        .and_then(|value| value.to_str().ok())
        .is_none_or(|value| value.trim() == etag);
    let range = if if_range_matches {
        parse_range(request_headers.get(header::RANGE), size)?
    } else {
        None
    };

    if let Some((start, end)) = range {
        let length = end - start + 1;
        debug!(file_id = id, start, end, length, "artifact range request accepted");
        response_headers.insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes {start}-{end}/{size}"))?,
        );
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        let body = artifact.content.slice(start as usize..=end as usize);
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from(body),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    info!(file_id = id, name = artifact.file_name, size, "serving artifact");
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from(artifact.content.clone()),
    )
        .into_response())
}

/// 内容不可变，id 与长度即可唯一标识版本。
fn etag_for(artifact: &Artifact) -> String {
    format!("\"{}-{}\"", artifact.id, artifact.byte_length())
}

fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .map(str::trim)
                .any(|item| item == "*" || item.trim_start_matches("W/") == etag)
        })
}

/// `inline`，文件名中的引号与控制字符替换为下划线。
fn content_disposition(file_name: &str) -> String {
    let safe: String = file_name
        .chars()
        .map(|c| {
            if c == '"' || c == '\\' || c.is_control() || !c.is_ascii() {
                '_'
            } else {
                c
            }
        })
        .collect();
    format!("inline; filename=\"{safe}\"")
}

fn header_value(value: &str) -> Result<HeaderValue, ApiError> {
    HeaderValue::from_str(value)
        .map_err(|_| ApiError::Internal("internal", "响应头构建失败".into()))
}

/// 解析 Range 头，返回可读取的范围；不满足时返回 `None` 以返回完整内容。
fn parse_range(value: Option<&HeaderValue>, size: u64) -> Result<Option<(u64, u64)>, ApiError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let Some(range) = value.to_str().ok().and_then(|v| v.strip_prefix("bytes=")) else {
        return Err(ApiError::BadRequest("invalid_range", "invalid Range header".into()));
    };
    if range.contains(',') {
        return Err(ApiError::BadRequest(
            "invalid_range",
            "multiple ranges not supported".into(),
        ));
    }
    if size == 0 {
        return Ok(None);
    }

    let (start_part, end_part) = range.split_once('-').unwrap_or((range, ""));
    let invalid = || ApiError::BadRequest("invalid_range", "invalid Range header".into());
    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Ok(None);
        }
        (size.saturating_sub(suffix), size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| invalid())?;
        let end: u64 = if end_part.is_empty() {
            size - 1
        } else {
            end_part.parse().map_err(|_| invalid())?
        };
        (start, end.min(size - 1))
    };

    if start > end || start >= size {
        return Ok(None);
    }
    Ok(Some((start, end)))
}
