//! 已完成文件的内存存储，按创建时间淘汰最旧条目以保持数量上限。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug)]
pub struct Artifact {
    pub id: String,
    pub file_name: String,
    pub mime_type: String,
    pub content: Bytes,
    pub created_at: Instant,
    pub uploaded_at: DateTime<Utc>,
}

impl Artifact {
    pub fn byte_length(&self) -> u64 {
        self.content.len() as u64
    }
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, Arc<Artifact>>,
    /// 淘汰顺序：(创建时间, 插入序号) -> id。
    order: BTreeMap<(Instant, u64), String>,
    next_seq: u64,
    total_bytes: u64,
}

/// 有容量上限的已完成文件存储。
#[derive(Debug)]
pub struct ArtifactStore {
    state: Mutex<StoreState>,
    capacity: usize,
}

impl ArtifactStore {
    /// 容量至少为 1，保证刚插入的条目不会被自身淘汰。
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 存入文件并返回新生成的 id；超出容量时同步淘汰最旧条目。
    pub async fn insert(&self, file_name: &str, mime_type: &str, content: Bytes) -> String {
        let mut state = self.state.lock().await;
        let id = loop {
            let candidate = Uuid::new_v4().simple().to_string();
            if !state.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        let artifact = Arc::new(Artifact {
            id: id.clone(),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            content,
            created_at: Instant::now(),
            uploaded_at: Utc::now(),
        });
        state.total_bytes += artifact.byte_length();
        state.order.insert((artifact.created_at, seq), id.clone());
        state.entries.insert(id.clone(), artifact);

        while state.entries.len() > self.capacity {
            let Some((_, evicted_id)) = state.order.pop_first() else {
                break;
            };
            if let Some(evicted) = state.entries.remove(&evicted_id) {
                state.total_bytes -= evicted.byte_length();
                info!(
                    file_id = evicted_id,
                    name = evicted.file_name,
                    bytes = evicted.byte_length(),
                    "artifact evicted"
                );
            }
        }

        id
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Artifact>> {
        self.state.lock().await.entries.get(id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.state.lock().await.total_bytes
    }
}
