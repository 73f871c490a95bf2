//! 上传编排：分片上传、单次上传与会话中止。
//!
//! 分片请求写入会话存储；收齐后拼接结果交给配置的存储端（本地或远端），
//! 并返回可放入二维码的访问地址。

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Extension, Multipart, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json as JsonResponse;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SinkKind;
use crate::error::{ApiError, RejectReason, UploadError, format_megabytes};
use crate::http::{RequestScheme, request_origin};
use crate::session::{ChunkOutcome, ChunkSessionStore, ChunkWrite, SessionProgress};
use crate::sink::{ArtifactSink, SinkLocation};

const PDF_MIME: &str = "application/pdf";

/// 上传编排器，持有会话存储与最终存储端。
pub struct Uploader {
    sessions: Arc<ChunkSessionStore>,
    sink: Arc<dyn ArtifactSink>,
    max_file_size: Option<u64>,
    public_url: Option<String>,
}

/// 分片上传表单字段（均为可选，缺失时由编排器报告）。
#[derive(Debug, Default)]
pub struct ChunkForm {
    pub upload_id: Option<String>,
    pub chunk_index: Option<u64>,
    pub total_chunks: Option<u64>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub chunk: Option<Bytes>,
}

#[derive(Debug)]
pub struct StoredUpload {
    pub location: SinkLocation,
    pub file_name: String,
    pub bytes: u64,
}

#[derive(Debug)]
pub enum ChunkReceipt {
    Pending(SessionProgress),
    Complete(StoredUpload),
}

#[derive(Serialize)]
#[serde(untagged)]
pub(crate) enum ChunkResponse {
    #[serde(rename_all = "camelCase")]
    Pending {
        complete: bool,
        received: u64,
        total: u64,
    },
    #[serde(rename_all = "camelCase")]
    Complete {
        complete: bool,
        url: String,
        file_name: String,
        file_size: String,
        file_bytes: u64,
        file_id: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileResponse {
    url: String,
    file_name: String,
    file_size: String,
    file_bytes: u64,
    upload_time: String,
    file_id: String,
}

impl Uploader {
    pub fn new(
        sessions: Arc<ChunkSessionStore>,
        sink: Arc<dyn ArtifactSink>,
        max_file_size: Option<u64>,
        public_url: Option<String>,
    ) -> Self {
        Self {
            sessions,
            sink,
            max_file_size,
            public_url,
        }
    }

    pub fn sessions(&self) -> &ChunkSessionStore {
        &self.sessions
    }

    pub fn sink_kind(&self) -> SinkKind {
        self.sink.kind()
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// 处理一个分片：校验字段、写入会话，收齐后存储并返回位置。
    pub async fn receive_chunk(&self, form: ChunkForm) -> Result<ChunkReceipt, UploadError> {
        let session_id = required(form.upload_id, "uploadId")?;
        let file_name = required(form.file_name, "fileName")?;
        let bytes = form
            .chunk
            .filter(|chunk| !chunk.is_empty())
            .ok_or(UploadError::MalformedRequest { field: "chunk" })?;
        let index = form
            .chunk_index
            .ok_or(UploadError::MalformedRequest { field: "chunkIndex" })?;
        let total = form
            .total_chunks
            .filter(|total| *total > 0)
            .ok_or(UploadError::MalformedRequest {
                field: "totalChunks",
            })?;
        let mime_type = resolve_mime(form.file_type.as_deref(), &file_name);
        ensure_pdf(&mime_type)?;

        let outcome = self
            .sessions
            .accept(ChunkWrite {
                session_id: session_id.clone(),
                index,
                total,
                file_name,
                mime_type,
                bytes,
            })
            .await?;

        match outcome {
            ChunkOutcome::Pending(progress) => Ok(ChunkReceipt::Pending(progress)),
            ChunkOutcome::Complete(file) => {
                let bytes = file.content.len() as u64;
                let location = self
                    .sink
                    .store(&file.file_name, &file.mime_type, file.content)
                    .await?;
                info!(
                    session_id,
                    file_id = location.file_id(),
                    name = file.file_name,
                    bytes,
                    "chunked upload complete"
                );
                Ok(ChunkReceipt::Complete(StoredUpload {
                    location,
                    file_name: file.file_name,
                    bytes,
                }))
            }
        }
    }

    /// 单次上传：跳过会话，校验类型与大小后直接存储整个文件。
    pub async fn receive_file(
        &self,
        file_name: &str,
        mime_type: &str,
        content: Bytes,
    ) -> Result<StoredUpload, UploadError> {
        let mime_type = resolve_mime(Some(mime_type), file_name);
        ensure_pdf(&mime_type)?;
        self.check_file_size(content.len() as u64)?;
        let bytes = content.len() as u64;
        let location = self.sink.store(file_name, &mime_type, content).await?;
        info!(
            file_id = location.file_id(),
            name = file_name,
            bytes,
            "single upload complete"
        );
        Ok(StoredUpload {
            location,
            file_name: file_name.to_string(),
            bytes,
        })
    }

    fn check_file_size(&self, size: u64) -> Result<(), UploadError> {
        match self.max_file_size {
            Some(limit) if size > limit => Err(RejectReason::TooLarge { size, limit }.into()),
            _ => Ok(()),
        }
    }

    fn origin(&self, headers: &HeaderMap, scheme: RequestScheme) -> String {
        request_origin(headers, scheme, self.public_url.as_deref())
    }
}

/// 接收单个分片。
pub async fn upload_chunk(
    Extension(uploader): Extension<Arc<Uploader>>,
    Extension(scheme): Extension<RequestScheme>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<JsonResponse<ChunkResponse>, ApiError> {
    let form = read_chunk_form(multipart).await?;
    let response = match uploader.receive_chunk(form).await? {
        ChunkReceipt::Pending(progress) => ChunkResponse::Pending {
            complete: false,
            received: progress.received,
            total: progress.total,
        },
        ChunkReceipt::Complete(stored) => ChunkResponse::Complete {
            complete: true,
            url: stored
                .location
                .resolve_url(&uploader.origin(&headers, scheme)),
            file_size: format_megabytes(stored.bytes),
            file_bytes: stored.bytes,
            file_id: stored.location.file_id().to_string(),
            file_name: stored.file_name,
        },
    };
    Ok(JsonResponse(response))
}

/// 单次上传整个 PDF 文件（字段 `file`）。
pub async fn upload_file(
    Extension(uploader): Extension<Arc<Uploader>>,
    Extension(scheme): Extension<RequestScheme>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<JsonResponse<FileResponse>, ApiError> {
    let started = Instant::now();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "document.pdf".to_string());
        let mime_type = resolve_mime(field.content_type(), &file_name);
        ensure_pdf(&mime_type)?;
        let content = read_limited(field, uploader.max_file_size()).await?;
        if content.is_empty() {
            return Err(UploadError::MalformedRequest { field: "file" }.into());
        }

        let stored = uploader
            .receive_file(&file_name, &mime_type, content)
            .await?;
        let elapsed = started.elapsed();
        return Ok(JsonResponse(FileResponse {
            url: stored
                .location
                .resolve_url(&uploader.origin(&headers, scheme)),
            file_size: format_megabytes(stored.bytes),
            file_bytes: stored.bytes,
            upload_time: format!("{:.1}s", elapsed.as_secs_f64()),
            file_id: stored.location.file_id().to_string(),
            file_name: stored.file_name,
        }));
    }
    Err(UploadError::MalformedRequest { field: "file" }.into())
}

/// 中止进行中的分片上传。
pub async fn abort_upload(
    Path(upload_id): Path<String>,
    Extension(uploader): Extension<Arc<Uploader>>,
) -> Result<StatusCode, ApiError> {
    uploader.sessions().abort(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_chunk_form(mut multipart: Multipart) -> Result<ChunkForm, ApiError> {
    let mut form = ChunkForm::default();
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        match name.as_str() {
            "chunk" => form.chunk = Some(field.bytes().await.map_err(multipart_error)?),
            "chunkIndex" => form.chunk_index = Some(parse_number(field, "chunkIndex").await?),
            "totalChunks" => form.total_chunks = Some(parse_number(field, "totalChunks").await?),
            "fileName" => form.file_name = Some(field.text().await.map_err(multipart_error)?),
            "fileType" => form.file_type = Some(field.text().await.map_err(multipart_error)?),
            "uploadId" => form.upload_id = Some(field.text().await.map_err(multipart_error)?),
            other => debug!(field = other, "ignoring unknown upload field"),
        }
    }
    Ok(form)
}

async fn parse_number(field: Field<'_>, name: &'static str) -> Result<u64, ApiError> {
    let text = field.text().await.map_err(multipart_error)?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| UploadError::MalformedRequest { field: name }.into())
}

/// 逐块读取字段，超过上限立即拒绝。
async fn read_limited(mut field: Field<'_>, limit: Option<u64>) -> Result<Bytes, ApiError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        let size = (buffer.len() + chunk.len()) as u64;
        if let Some(limit) = limit
            && size > limit
        {
            return Err(UploadError::from(RejectReason::TooLarge { size, limit }).into());
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

fn multipart_error(err: MultipartError) -> ApiError {
    let message = err.body_text();
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return ApiError::PayloadTooLarge(message);
    }
    warn!(error = %message, "malformed multipart body");
    ApiError::BadRequest("malformed_request", message)
}

fn required(value: Option<String>, field: &'static str) -> Result<String, UploadError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or(UploadError::MalformedRequest { field })
}

/// 声明的类型为空时按文件名推断。
fn resolve_mime(declared: Option<&str>, file_name: &str) -> String {
    match declared
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(essence) => essence.to_ascii_lowercase(),
        None => mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .essence_str()
            .to_string(),
    }
}

fn ensure_pdf(mime_type: &str) -> Result<(), UploadError> {
    if mime_type == PDF_MIME {
        return Ok(());
    }
    Err(RejectReason::UnsupportedType {
        received: mime_type.to_string(),
    }
    .into())
}
