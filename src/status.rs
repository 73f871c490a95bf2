//! 运行状态与版本信息处理器。

use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;

use crate::artifact::ArtifactStore;
use crate::config::SinkKind;
use crate::error::ApiError;
use crate::upload::Uploader;

/// 进程启动时刻，用于计算运行时长。
#[derive(Clone, Copy, Debug)]
pub struct StartedAt(pub Instant);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    success: bool,
    files_stored: usize,
    sessions_in_flight: usize,
    bytes_stored: u64,
    memory_usage: Option<String>,
    uptime: String,
    timestamp: String,
    sink: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
    build_env: String,
}

/// 返回已存文件数、进行中的分片会话、内存占用与运行时长。
pub async fn get_status(
    Extension(store): Extension<Arc<ArtifactStore>>,
    Extension(uploader): Extension<Arc<Uploader>>,
    Extension(StartedAt(started_at)): Extension<StartedAt>,
) -> Result<JsonResponse<StatusInfo>, ApiError> {
    Ok(JsonResponse(StatusInfo {
        success: true,
        files_stored: store.count().await,
        sessions_in_flight: uploader.sessions().len().await,
        bytes_stored: store.total_bytes().await,
        memory_usage: resident_memory_kib()
            .await
            .map(|kib| format!("{:.1} MB", kib as f64 / 1024.0)),
        uptime: format!("{}s", started_at.elapsed().as_secs()),
        timestamp: Utc::now().to_rfc3339(),
        sink: match uploader.sink_kind() {
            SinkKind::Local => "local",
            SinkKind::Drive => "drive",
        },
    }))
}

/// 返回当前版本信息。
pub async fn get_version_info() -> Result<JsonResponse<VersionInfo>, ApiError> {
    Ok(JsonResponse(VersionInfo {
        version: crate::build::PKG_VERSION,
        commit: crate::build::SHORT_COMMIT,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
    }))
}

/// 读取 `/proc/self/status` 中的 `VmRSS`（KiB）；非 Linux 平台返回 `None`。
async fn resident_memory_kib() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").await.ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|value| value.parse().ok())
}
