//! 登录会话清理与闲置分片会话过期的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::auth::AuthConfig;
use crate::config::{AUTH_PRUNE_INTERVAL_SECS, UPLOAD_SWEEP_INTERVAL_SECS};
use crate::session::ChunkSessionStore;

/// 启动后台任务；`session_ttl` 为 `None` 时分片会话永不过期。
pub fn spawn_background_tasks(
    auth: Arc<AuthConfig>,
    sessions: Arc<ChunkSessionStore>,
    session_ttl: Option<Duration>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(AUTH_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            auth.prune().await;
        }
    });

    let Some(ttl) = session_ttl else {
        return;
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let removed = sessions.prune_idle(ttl).await;
            if removed > 0 {
                debug!(removed, "idle upload sweep finished");
            }
        }
    });
}
