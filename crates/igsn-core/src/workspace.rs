//! Request-scoped data directory.
//!
//! ```text
//! {requests_dir}/{request_id}/
//!     payload.{ext}        raw batch as submitted
//!     chunks/0001.xml      one file per resource
//!     request.log          audit log (owned by AuditLogger)
//! ```

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

pub const PAYLOAD_STEM: &str = "payload";
pub const CHUNKS_DIR: &str = "chunks";

#[derive(Debug, Clone)]
pub struct RequestWorkspace {
    root: PathBuf,
}

impl RequestWorkspace {
    pub async fn create(requests_dir: &Path, request_id: Uuid) -> Result<Self> {
        let root = requests_dir.join(request_id.to_string());
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.root.join(CHUNKS_DIR)
    }

    pub async fn write_payload(&self, content: &[u8], extension: &str) -> Result<PathBuf> {
        let path = self.root.join(format!("{PAYLOAD_STEM}.{extension}"));
        fs::write(&path, content).await?;
        debug!(path = %path.display(), bytes = content.len(), "Payload written");
        Ok(path)
    }

    /// Write chunk `index` (1-based) as `chunks/{index:04}.{extension}`.
    pub async fn write_chunk(&self, index: usize, content: &[u8], extension: &str) -> Result<PathBuf> {
        let dir = self.chunks_dir();
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{index:04}.{extension}"));
        fs::write(&path, content).await?;
        Ok(path)
    }

    pub async fn remove(self) -> Result<()> {
        fs::remove_dir_all(&self.root).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lays_out_payload_and_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let request_id = Uuid::new_v4();
        let workspace = RequestWorkspace::create(dir.path(), request_id).await.unwrap();

        let payload = workspace.write_payload(b"<resources/>", "xml").await.unwrap();
        assert!(payload.ends_with(format!("{request_id}/payload.xml")));

        let chunk = workspace.write_chunk(1, b"<resource/>", "xml").await.unwrap();
        assert!(chunk.ends_with("chunks/0001.xml"));
        assert_eq!(fs::read(&chunk).await.unwrap(), b"<resource/>");

        let root = workspace.root().to_path_buf();
        workspace.remove().await.unwrap();
        assert!(!root.exists());
    }
}
