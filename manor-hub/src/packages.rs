//! Package manager
//!
//! Materializes each instance's deployable artifact under a per-instance
//! directory and gates process start on package activation. Debug and
//! update flows push the artifact in chunks; the assembled file must match
//! the MD5 the uploader advertised up front or the whole upload session is
//! discarded.
//!
//! Layout under the package root:
//! `<instance_id>/package.bin` — the assembled artifact;
//! `<instance_id>/.inactive` — marker gating process start;
//! `<instance_id>/incoming/` — chunk staging for an upload in flight.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use manor_wire::UploadStatusResponse;
use md5::{Digest, Md5};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const PACKAGE_FILE: &str = "package.bin";
const INACTIVE_MARKER: &str = ".inactive";

struct UploadSession {
    total_chunks: u32,
    file_hash: String,
    received: Vec<bool>,
}

impl UploadSession {
    fn received_count(&self) -> u32 {
        self.received.iter().filter(|r| **r).count() as u32
    }

    fn status(&self) -> UploadStatusResponse {
        let received = self.received_count();
        UploadStatusResponse {
            total_chunks: self.total_chunks,
            received_chunks: received,
            progress: f64::from(received) / f64::from(self.total_chunks.max(1)),
            completed: false,
        }
    }
}

/// Per-instance package store with chunked uploads.
pub struct PackageManager {
    root: PathBuf,
    uploads: DashMap<String, Arc<Mutex<UploadSession>>>,
}

impl PackageManager {
    /// Open the store, creating the package root if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            uploads: DashMap::new(),
        })
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.root.join(instance_id)
    }

    fn staging_dir(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join("incoming")
    }

    /// Path of the assembled artifact for an instance.
    pub fn package_path(&self, instance_id: &str) -> PathBuf {
        self.instance_dir(instance_id).join(PACKAGE_FILE)
    }

    /// Whether an artifact has been assembled for the instance.
    pub fn is_available(&self, instance_id: &str) -> bool {
        self.package_path(instance_id).exists()
    }

    /// Whether the instance may be started: an artifact exists and nobody
    /// marked it inactive.
    pub fn is_active(&self, instance_id: &str) -> bool {
        self.is_available(instance_id)
            && !self.instance_dir(instance_id).join(INACTIVE_MARKER).exists()
    }

    /// Flip the active gate.
    pub async fn set_active(&self, instance_id: &str, active: bool) -> Result<()> {
        let marker = self.instance_dir(instance_id).join(INACTIVE_MARKER);
        if active {
            match tokio::fs::remove_file(&marker).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            tokio::fs::create_dir_all(self.instance_dir(instance_id)).await?;
            tokio::fs::write(&marker, b"").await?;
        }
        Ok(())
    }

    /// Accept one upload chunk. Chunks for one instance are serialized by a
    /// per-instance lock; distinct instances upload concurrently.
    pub async fn handle_chunk(
        &self,
        instance_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        file_hash: &str,
        chunk: &[u8],
    ) -> Result<UploadStatusResponse> {
        if total_chunks == 0 {
            return Err(Error::InvalidRequest("totalChunks must be positive".into()));
        }
        if chunk_index >= total_chunks {
            return Err(Error::InvalidRequest(format!(
                "chunkIndex {} out of range ({} chunks)",
                chunk_index, total_chunks
            )));
        }
        if file_hash.is_empty() {
            return Err(Error::InvalidRequest("fileHash is required".into()));
        }

        let session = {
            let entry = self.uploads.entry(instance_id.to_string());
            entry
                .or_insert_with(|| {
                    Arc::new(Mutex::new(UploadSession {
                        total_chunks,
                        file_hash: file_hash.to_lowercase(),
                        received: vec![false; total_chunks as usize],
                    }))
                })
                .clone()
        };
        let mut session = session.lock().await;

        // A chunk announcing different upload parameters starts over.
        if session.total_chunks != total_chunks
            || session.file_hash != file_hash.to_lowercase()
        {
            tracing::info!(
                "upload for {} restarted with new parameters",
                instance_id
            );
            self.purge_staging(instance_id).await;
            session.total_chunks = total_chunks;
            session.file_hash = file_hash.to_lowercase();
            session.received = vec![false; total_chunks as usize];
        }

        let staging = self.staging_dir(instance_id);
        tokio::fs::create_dir_all(&staging).await?;
        tokio::fs::write(staging.join(format!("{}.part", chunk_index)), chunk).await?;
        session.received[chunk_index as usize] = true;

        if session.received.iter().all(|r| *r) {
            let expected = session.file_hash.clone();
            let total = session.total_chunks;
            drop(session);
            self.uploads.remove(instance_id);
            self.assemble(instance_id, total, &expected).await?;
            return Ok(UploadStatusResponse {
                total_chunks: total,
                received_chunks: total,
                progress: 1.0,
                completed: true,
            });
        }

        Ok(session.status())
    }

    /// Upload progress, or completion if an artifact is already in place.
    pub async fn upload_status(&self, instance_id: &str) -> Option<UploadStatusResponse> {
        if let Some(session) = self.uploads.get(instance_id).map(|s| s.clone()) {
            return Some(session.lock().await.status());
        }
        if self.is_available(instance_id) {
            return Some(UploadStatusResponse {
                total_chunks: 0,
                received_chunks: 0,
                progress: 1.0,
                completed: true,
            });
        }
        None
    }

    async fn assemble(&self, instance_id: &str, total_chunks: u32, expected_md5: &str) -> Result<()> {
        let staging = self.staging_dir(instance_id);
        let mut hasher = Md5::new();
        let mut assembled = Vec::new();
        for index in 0..total_chunks {
            let chunk = tokio::fs::read(staging.join(format!("{}.part", index))).await?;
            hasher.update(&chunk);
            assembled.extend_from_slice(&chunk);
        }

        let actual = hex::encode(hasher.finalize());
        if actual != expected_md5 {
            self.purge_staging(instance_id).await;
            return Err(Error::InvalidRequest(format!(
                "assembled file hash {} does not match advertised {}",
                actual, expected_md5
            )));
        }

        let target = self.package_path(instance_id);
        let tmp = target.with_extension("bin.tmp");
        tokio::fs::write(&tmp, &assembled).await?;
        tokio::fs::rename(&tmp, &target).await?;
        self.purge_staging(instance_id).await;

        tracing::info!(
            "package for {} assembled ({} bytes)",
            instance_id,
            assembled.len()
        );
        Ok(())
    }

    async fn purge_staging(&self, instance_id: &str) {
        let staging = self.staging_dir(instance_id);
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to purge staging for {}: {}", instance_id, e);
            }
        }
    }
}

/// Hex MD5 of a byte slice; what uploaders advertise as `fileHash`.
pub fn md5_hex(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(payload: &[u8], pieces: usize) -> Vec<Vec<u8>> {
        let size = payload.len().div_ceil(pieces);
        payload.chunks(size).map(<[u8]>::to_vec).collect()
    }

    async fn manager() -> (tempfile::TempDir, PackageManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = PackageManager::open(dir.path().join("packages")).unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn chunks_assemble_out_of_order() {
        let (_dir, manager) = manager().await;
        let payload = b"a perfectly ordinary application artifact".repeat(100);
        let chunks = split(&payload, 3);
        let hash = md5_hex(&payload);

        let status = manager
            .handle_chunk("notes", 2, 3, &hash, &chunks[2])
            .await
            .unwrap();
        assert!(!status.completed);
        assert_eq!(status.received_chunks, 1);

        manager
            .handle_chunk("notes", 0, 3, &hash, &chunks[0])
            .await
            .unwrap();
        let status = manager
            .handle_chunk("notes", 1, 3, &hash, &chunks[1])
            .await
            .unwrap();
        assert!(status.completed);
        assert_eq!(status.progress, 1.0);

        assert!(manager.is_available("notes"));
        assert!(manager.is_active("notes"));
        let assembled = tokio::fs::read(manager.package_path("notes")).await.unwrap();
        assert_eq!(assembled, payload);
    }

    #[tokio::test]
    async fn hash_mismatch_purges_the_session() {
        let (_dir, manager) = manager().await;
        let payload = b"artifact".to_vec();
        let wrong_hash = md5_hex(b"something else");

        let err = manager
            .handle_chunk("notes", 0, 1, &wrong_hash, &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(!manager.is_available("notes"));
        assert!(manager.upload_status("notes").await.is_none());
    }

    #[tokio::test]
    async fn progress_is_reported_midway() {
        let (_dir, manager) = manager().await;
        let payload = b"0123456789".repeat(50);
        let chunks = split(&payload, 4);
        let hash = md5_hex(&payload);

        manager
            .handle_chunk("notes", 0, 4, &hash, &chunks[0])
            .await
            .unwrap();
        manager
            .handle_chunk("notes", 1, 4, &hash, &chunks[1])
            .await
            .unwrap();

        let status = manager.upload_status("notes").await.unwrap();
        assert_eq!(status.total_chunks, 4);
        assert_eq!(status.received_chunks, 2);
        assert!((status.progress - 0.5).abs() < f64::EPSILON);
        assert!(!status.completed);
    }

    #[tokio::test]
    async fn activation_gates_without_touching_the_artifact() {
        let (_dir, manager) = manager().await;
        let payload = b"artifact".to_vec();
        let hash = md5_hex(&payload);
        manager
            .handle_chunk("notes", 0, 1, &hash, &payload)
            .await
            .unwrap();

        assert!(manager.is_active("notes"));
        manager.set_active("notes", false).await.unwrap();
        assert!(!manager.is_active("notes"));
        assert!(manager.is_available("notes"));
        manager.set_active("notes", true).await.unwrap();
        assert!(manager.is_active("notes"));
    }

    #[tokio::test]
    async fn invalid_chunk_parameters_are_rejected() {
        let (_dir, manager) = manager().await;
        assert!(manager
            .handle_chunk("notes", 0, 0, "abc", b"x")
            .await
            .is_err());
        assert!(manager
            .handle_chunk("notes", 5, 3, "abc", b"x")
            .await
            .is_err());
        assert!(manager.handle_chunk("notes", 0, 3, "", b"x").await.is_err());
    }

    #[tokio::test]
    async fn nothing_is_active_before_any_upload() {
        let (_dir, manager) = manager().await;
        assert!(!manager.is_available("ghost"));
        assert!(!manager.is_active("ghost"));
        assert!(manager.upload_status("ghost").await.is_none());
    }
}
