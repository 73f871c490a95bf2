//! 已完成文件的去处：本地内存存储或远端持久存储。

use async_trait::async_trait;
use bytes::Bytes;

use crate::artifact::ArtifactStore;
use crate::config::SinkKind;
use crate::error::UploadError;

/// 文件存入后的位置信息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkLocation {
    Local { artifact_id: String },
    Remote { file_id: String, url: String },
}

impl SinkLocation {
    pub fn file_id(&self) -> &str {
        match self {
            SinkLocation::Local { artifact_id } => artifact_id,
            SinkLocation::Remote { file_id, .. } => file_id,
        }
    }

    /// 生成可放入二维码的访问地址。
    pub fn resolve_url(&self, origin: &str) -> String {
        match self {
            SinkLocation::Local { artifact_id } => {
                format!("{}/api/file/{artifact_id}", origin.trim_end_matches('/'))
            }
            SinkLocation::Remote { url, .. } => url.clone(),
        }
    }
}

#[async_trait]
pub trait ArtifactSink: Send + Sync {
    fn kind(&self) -> SinkKind;

    async fn store(
        &self,
        file_name: &str,
        mime_type: &str,
        content: Bytes,
    ) -> Result<SinkLocation, UploadError>;
}

#[async_trait]
impl ArtifactSink for ArtifactStore {
    fn kind(&self) -> SinkKind {
        SinkKind::Local
    }

    async fn store(
        &self,
        file_name: &str,
        mime_type: &str,
        content: Bytes,
    ) -> Result<SinkLocation, UploadError> {
        let artifact_id = self.insert(file_name, mime_type, content).await;
        Ok(SinkLocation::Local { artifact_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_location_builds_retrieval_url() {
        let location = SinkLocation::Local {
            artifact_id: "abc123".into(),
        };
        assert_eq!(
            location.resolve_url("https://share.example.com/"),
            "https://share.example.com/api/file/abc123"
        );
        assert_eq!(location.file_id(), "abc123");
    }

    #[test]
    fn remote_location_keeps_remote_url() {
        let location = SinkLocation::Remote {
            file_id: "drive-id".into(),
            url: "https://drive.google.com/file/d/drive-id/view".into(),
        };
        assert_eq!(
            location.resolve_url("http://localhost:5005"),
            "https://drive.google.com/file/d/drive-id/view"
        );
    }

    #[tokio::test]
    async fn artifact_store_acts_as_local_sink() {
        let store = ArtifactStore::new(2);
        let location = store
            .store("a.pdf", "application/pdf", Bytes::from_static(b"%PDF"))
            .await
            .expect("store");
        let artifact = store.get(location.file_id()).await.expect("stored");
        assert_eq!(&artifact.content[..], b"%PDF");
        assert_eq!(store.kind(), SinkKind::Local);
    }
}
