//! 分片上传会话：按索引缓存分片、检测完成并拼接。
//!
//! 会话表只在查找/插入/删除时加锁；每个会话自带一把异步互斥锁，
//! 同一会话的写入、完成判定与拼接在这把锁内串行执行，不同会话互不阻塞。

use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RejectReason, UploadError};

/// 会话存储的资源上限（`None` 表示不限制）。
#[derive(Debug, Clone, Default)]
pub struct SessionLimits {
    pub max_chunk_size: Option<u64>,
    pub max_total_size: Option<u64>,
    pub max_chunks: Option<u64>,
    pub max_sessions: Option<u64>,
}

/// 一次分片写入请求。
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub session_id: String,
    pub index: u64,
    pub total: u64,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProgress {
    pub received: u64,
    pub total: u64,
}

impl SessionProgress {
    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}

/// 拼接完成的文件，所有权交给调用方。
#[derive(Debug)]
pub struct AssembledFile {
    pub file_name: String,
    pub mime_type: String,
    pub content: Bytes,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    Pending(SessionProgress),
    Complete(AssembledFile),
}

#[derive(Debug)]
struct UploadSession {
    file_name: String,
    mime_type: String,
    total: u64,
    /// 已收到的分片，按索引稀疏存放。
    chunks: BTreeMap<u64, Bytes>,
    bytes_received: u64,
    last_activity: Instant,
    closed: bool,
}

impl UploadSession {
    fn new(write: &ChunkWrite) -> Self {
        Self {
            file_name: write.file_name.clone(),
            mime_type: write.mime_type.clone(),
            total: write.total,
            chunks: BTreeMap::new(),
            bytes_received: 0,
            last_activity: Instant::now(),
            closed: false,
        }
    }

    fn total(&self) -> u64 {
        self.total
    }

    fn received(&self) -> u64 {
        self.chunks.len() as u64
    }

    fn progress(&self) -> SessionProgress {
        SessionProgress {
            received: self.received(),
            total: self.total,
        }
    }

    fn is_complete(&self) -> bool {
        self.received() == self.total
    }

    /// 写入指定位置；校验全部通过后才修改状态。
    fn write(
        &mut self,
        session_id: &str,
        write: ChunkWrite,
        limits: &SessionLimits,
    ) -> Result<SessionProgress, UploadError> {
        let total = self.total();
        if write.index >= total {
            return Err(UploadError::InvalidChunkIndex {
                index: write.index,
                total,
            });
        }
        if write.total != total {
            warn!(
                session_id,
                declared = write.total,
                expected = total,
                "chunk declares a different total, keeping the first one"
            );
        }

        let previous = self
            .chunks
            .get(&write.index)
            .map_or(0, |chunk| chunk.len() as u64);
        let size = write.bytes.len() as u64;
        let new_total = self.bytes_received - previous + size;
        if let Some(limit) = limits.max_total_size
            && new_total > limit
        {
            return Err(RejectReason::TooLarge {
                size: new_total,
                limit,
            }
            .into());
        }

        self.chunks.insert(write.index, write.bytes);
        self.bytes_received = new_total;
        self.last_activity = Instant::now();
        debug!(
            session_id,
            chunk_index = write.index,
            bytes = size,
            received = self.received(),
            total,
            "chunk stored"
        );
        Ok(self.progress())
    }

    /// 按索引顺序拼接，并释放分片缓冲。
    fn assemble(&mut self) -> AssembledFile {
        let mut content = BytesMut::with_capacity(self.bytes_received as usize);
        for chunk in std::mem::take(&mut self.chunks).into_values() {
            content.extend_from_slice(&chunk);
        }
        self.closed = true;
        AssembledFile {
            file_name: std::mem::take(&mut self.file_name),
            mime_type: std::mem::take(&mut self.mime_type),
            content: content.freeze(),
        }
    }
}

type SessionHandle = Arc<Mutex<UploadSession>>;

/// 进行中的分片上传会话集合。
#[derive(Debug, Default)]
pub struct ChunkSessionStore {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    limits: SessionLimits,
}

impl ChunkSessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
        }
    }

    /// 写入一个分片，返回当前进度。
    pub async fn begin_or_continue(&self, write: ChunkWrite) -> Result<SessionProgress, UploadError> {
        self.check_chunk(&write)?;
        loop {
            let handle = self.acquire(&write).await?;
            let mut session = handle.lock().await;
            if session.closed {
                continue;
            }
            let session_id = write.session_id.clone();
            return session.write(&session_id, write, &self.limits);
        }
    }

    /// 会话是否已收齐全部分片；未知会话返回 false。
    pub async fn is_complete(&self, session_id: &str) -> bool {
        let Some(handle) = self.lookup(session_id).await else {
            return false;
        };
        let session = handle.lock().await;
        !session.closed && session.is_complete()
    }

    /// 拼接已完成的会话并将其移除。
    pub async fn finalize(&self, session_id: &str) -> Result<AssembledFile, UploadError> {
        let not_found = || UploadError::SessionNotFound {
            session_id: session_id.to_string(),
        };
        let handle = self.lookup(session_id).await.ok_or_else(not_found)?;
        let mut session = handle.lock().await;
        if session.closed {
            return Err(not_found());
        }
        if !session.is_complete() {
            return Err(UploadError::IncompleteSession {
                session_id: session_id.to_string(),
                received: session.received(),
                total: session.total(),
            });
        }
        let file = session.assemble();
        self.sessions.lock().await.remove(session_id);
        Ok(file)
    }

    /// 写入分片；若因此收齐，则在同一临界区内完成拼接并移除会话。
    pub async fn accept(&self, write: ChunkWrite) -> Result<ChunkOutcome, UploadError> {
        self.check_chunk(&write)?;
        let session_id = write.session_id.clone();
        loop {
            let handle = self.acquire(&write).await?;
            let mut session = handle.lock().await;
            if session.closed {
                continue;
            }
            let progress = session.write(&session_id, write, &self.limits)?;
            if !progress.is_complete() {
                return Ok(ChunkOutcome::Pending(progress));
            }
            let file = session.assemble();
            self.sessions.lock().await.remove(&session_id);
            info!(
                session_id,
                name = file.file_name,
                bytes = file.content.len(),
                chunks = progress.total,
                "upload session assembled"
            );
            return Ok(ChunkOutcome::Complete(file));
        }
    }

    /// 丢弃进行中的会话。
    pub async fn abort(&self, session_id: &str) -> Result<(), UploadError> {
        let handle = self
            .lookup(session_id)
            .await
            .ok_or_else(|| UploadError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let mut session = handle.lock().await;
        session.closed = true;
        session.chunks.clear();
        self.sessions.lock().await.remove(session_id);
        info!(session_id, "upload session aborted");
        Ok(())
    }

    /// 清理空闲超过 `ttl` 的会话，返回清理数量。正在写入的会话会被跳过。
    pub async fn prune_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|session_id, handle| {
            let Ok(mut session) = handle.try_lock() else {
                return true;
            };
            if session.last_activity.elapsed() < ttl {
                return true;
            }
            info!(
                session_id = session_id.as_str(),
                received = session.received(),
                total = session.total(),
                "upload session expired"
            );
            session.closed = true;
            session.chunks.clear();
            false
        });
        before - sessions.len()
    }

    /// 进行中的会话数量。
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// 空分片不计入进度，直接拒绝。
    fn check_chunk(&self, write: &ChunkWrite) -> Result<(), UploadError> {
        if write.bytes.is_empty() {
            return Err(UploadError::MalformedRequest { field: "chunk" });
        }
        let size = write.bytes.len() as u64;
        if let Some(limit) = self.limits.max_chunk_size
            && size > limit
        {
            return Err(RejectReason::ChunkTooLarge { size, limit }.into());
        }
        Ok(())
    }

    async fn lookup(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// 取得会话句柄；会话不存在时先校验声明的元数据再创建。
    async fn acquire(&self, write: &ChunkWrite) -> Result<SessionHandle, UploadError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(&write.session_id) {
            return Ok(handle.clone());
        }

        if write.index >= write.total {
            return Err(UploadError::InvalidChunkIndex {
                index: write.index,
                total: write.total,
            });
        }
        if let Some(limit) = self.limits.max_chunks
            && write.total > limit
        {
            return Err(RejectReason::TooManyChunks {
                declared: write.total,
                limit,
            }
            .into());
        }
        if let Some(limit) = self.limits.max_sessions
            && sessions.len() as u64 >= limit
        {
            return Err(UploadError::TooManySessions { limit });
        }

        let handle = Arc::new(Mutex::new(UploadSession::new(write)));
        sessions.insert(write.session_id.clone(), handle.clone());
        info!(
            session_id = write.session_id,
            name = write.file_name,
            total_chunks = write.total,
            "upload session created"
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(session_id: &str, index: u64, total: u64, data: &'static [u8]) -> ChunkWrite {
        ChunkWrite {
            session_id: session_id.to_string(),
            index,
            total,
            file_name: "doc.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_reassemble_by_index() {
        let store = ChunkSessionStore::default();

        let progress = store
            .begin_or_continue(chunk("s1", 1, 3, b"BBBB"))
            .await
            .expect("chunk 1");
        assert_eq!(progress, SessionProgress { received: 1, total: 3 });
        store
            .begin_or_continue(chunk("s1", 0, 3, b"AAAA"))
            .await
            .expect("chunk 0");
        assert!(!store.is_complete("s1").await);

        let progress = store
            .begin_or_continue(chunk("s1", 2, 3, b"CC"))
            .await
            .expect("chunk 2");
        assert!(progress.is_complete());
        assert!(store.is_complete("s1").await);

        let file = store.finalize("s1").await.expect("finalize");
        assert_eq!(file.content.len(), 10);
        assert_eq!(&file.content[..], b"AAAABBBBCC");
        assert_eq!(store.len().await, 0);
        assert!(matches!(
            store.finalize("s1").await,
            Err(UploadError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn every_delivery_order_yields_same_bytes() {
        let parts: [&'static [u8]; 3] = [b"one-", b"two-", b"three"];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let store = ChunkSessionStore::default();
            let mut assembled = None;
            for index in order {
                let outcome = store
                    .accept(chunk("perm", index, 3, parts[index as usize]))
                    .await
                    .expect("accept");
                if let ChunkOutcome::Complete(file) = outcome {
                    assembled = Some(file);
                }
            }
            let file = assembled.expect("completed");
            assert_eq!(&file.content[..], b"one-two-three", "order {order:?}");
        }
    }

    #[tokio::test]
    async fn retransmitted_chunk_is_idempotent() {
        let store = ChunkSessionStore::default();
        store
            .begin_or_continue(chunk("s1", 0, 2, b"head"))
            .await
            .expect("chunk 0");
        let progress = store
            .begin_or_continue(chunk("s1", 0, 2, b"head"))
            .await
            .expect("chunk 0 again");
        assert_eq!(progress.received, 1);

        store
            .begin_or_continue(chunk("s1", 1, 2, b"tail"))
            .await
            .expect("chunk 1");
        let file = store.finalize("s1").await.expect("finalize");
        assert_eq!(&file.content[..], b"headtail");
    }

    #[tokio::test]
    async fn single_chunk_completes_immediately() {
        let store = ChunkSessionStore::default();
        let outcome = store.accept(chunk("one", 0, 1, b"%PDF")).await.expect("accept");
        let ChunkOutcome::Complete(file) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(&file.content[..], b"%PDF");
        assert_eq!(file.file_name, "doc.pdf");
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn out_of_range_index_leaves_state_unchanged() {
        let store = ChunkSessionStore::default();
        let result = store.begin_or_continue(chunk("fresh", 5, 3, b"x")).await;
        assert!(matches!(
            result,
            Err(UploadError::InvalidChunkIndex { index: 5, total: 3 })
        ));
        assert_eq!(store.len().await, 0);

        store
            .begin_or_continue(chunk("s1", 0, 3, b"a"))
            .await
            .expect("chunk 0");
        let result = store.begin_or_continue(chunk("s1", 5, 3, b"x")).await;
        assert!(matches!(result, Err(UploadError::InvalidChunkIndex { .. })));
        let Err(UploadError::IncompleteSession {
            received, total, ..
        }) = store.finalize("s1").await
        else {
            panic!("expected incomplete session");
        };
        assert_eq!((received, total), (1, 3));
    }

    #[tokio::test]
    async fn later_metadata_is_ignored() {
        let store = ChunkSessionStore::default();
        store
            .begin_or_continue(chunk("s1", 0, 2, b"a"))
            .await
            .expect("chunk 0");
        let mut second = chunk("s1", 1, 7, b"b");
        second.file_name = "renamed.pdf".to_string();
        let progress = store.begin_or_continue(second).await.expect("chunk 1");
        assert_eq!(progress, SessionProgress { received: 2, total: 2 });
        let file = store.finalize("s1").await.expect("finalize");
        assert_eq!(file.file_name, "doc.pdf");
    }

    #[tokio::test]
    async fn limits_reject_before_mutation() {
        let store = ChunkSessionStore::new(SessionLimits {
            max_chunk_size: Some(4),
            max_total_size: Some(6),
            max_chunks: Some(3),
            max_sessions: Some(1),
        });

        let result = store.begin_or_continue(chunk("s1", 0, 2, b"12345")).await;
        assert!(matches!(
            result,
            Err(UploadError::PayloadRejected(RejectReason::ChunkTooLarge { .. }))
        ));
        let result = store.begin_or_continue(chunk("s1", 0, 4, b"1")).await;
        assert!(matches!(
            result,
            Err(UploadError::PayloadRejected(RejectReason::TooManyChunks { .. }))
        ));
        assert_eq!(store.len().await, 0);

        store
            .begin_or_continue(chunk("s1", 0, 3, b"1234"))
            .await
            .expect("chunk 0");
        let result = store.begin_or_continue(chunk("s1", 1, 3, b"567")).await;
        assert!(matches!(
            result,
            Err(UploadError::PayloadRejected(RejectReason::TooLarge { size: 7, limit: 6 }))
        ));
        let result = store.begin_or_continue(chunk("s2", 0, 1, b"z")).await;
        assert!(matches!(result, Err(UploadError::TooManySessions { limit: 1 })));
    }

    #[tokio::test]
    async fn huge_declared_total_does_not_preallocate() {
        let store = ChunkSessionStore::default();
        let progress = store
            .begin_or_continue(chunk("huge", 0, u64::MAX, b"%PDF"))
            .await
            .expect("chunk 0");
        assert_eq!(progress, SessionProgress { received: 1, total: u64::MAX });
        assert!(!store.is_complete("huge").await);

        let outcome = store
            .accept(chunk("huge", u64::MAX - 1, u64::MAX, b"tail"))
            .await
            .expect("last index");
        assert!(matches!(
            outcome,
            ChunkOutcome::Pending(SessionProgress { received: 2, .. })
        ));
        store.abort("huge").await.expect("abort");
    }

    #[tokio::test]
    async fn empty_chunk_is_rejected_without_progress() {
        let store = ChunkSessionStore::default();
        let result = store.accept(chunk("s1", 0, 1, b"")).await;
        assert!(matches!(
            result,
            Err(UploadError::MalformedRequest { field: "chunk" })
        ));
        assert_eq!(store.len().await, 0);

        store
            .begin_or_continue(chunk("s2", 0, 2, b"head"))
            .await
            .expect("chunk 0");
        let result = store.begin_or_continue(chunk("s2", 1, 2, b"")).await;
        assert!(matches!(result, Err(UploadError::MalformedRequest { .. })));
        assert!(!store.is_complete("s2").await);
        assert!(matches!(
            store.finalize("s2").await,
            Err(UploadError::IncompleteSession { received: 1, total: 2, .. })
        ));
    }

    #[tokio::test]
    async fn abort_and_prune_remove_sessions() {
        let store = ChunkSessionStore::default();
        store
            .begin_or_continue(chunk("a", 0, 2, b"a"))
            .await
            .expect("chunk a");
        store
            .begin_or_continue(chunk("b", 0, 2, b"b"))
            .await
            .expect("chunk b");

        store.abort("a").await.expect("abort");
        assert!(matches!(
            store.abort("a").await,
            Err(UploadError::SessionNotFound { .. })
        ));

        assert_eq!(store.prune_idle(Duration::from_secs(3600)).await, 0);
        assert_eq!(store.prune_idle(Duration::ZERO).await, 1);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_complete_exactly_once() {
        let store = Arc::new(ChunkSessionStore::default());
        let mut tasks = Vec::new();
        for session in ["left", "right"] {
            for index in 0..16u64 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    let data = Bytes::from(vec![index as u8; 8]);
                    let write = ChunkWrite {
                        session_id: session.to_string(),
                        index,
                        total: 16,
                        file_name: format!("{session}.pdf"),
                        mime_type: "application/pdf".to_string(),
                        bytes: data,
                    };
                    store.accept(write).await.expect("accept")
                }));
            }
        }

        let mut completed = Vec::new();
        for task in tasks {
            if let ChunkOutcome::Complete(file) = task.await.expect("join") {
                completed.push(file);
            }
        }
        assert_eq!(completed.len(), 2);
        for file in completed {
            let expected: Vec<u8> = (0..16u8).flat_map(|i| [i; 8]).collect();
            assert_eq!(&file.content[..], &expected[..], "{}", file.file_name);
        }
        assert_eq!(store.len().await, 0);
    }
}
