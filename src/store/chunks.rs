//! Chunk Object Store (spec §4.2, C2).
//!
//! The filesystem backend writes via a temp-file-then-rename, the
//! same discipline the teacher uses in `tools::file_set_contents`
//! (`mkstemp` into the target directory, then atomic rename) so a
//! crash mid-write never leaves a partial chunk visible to readers.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::ObsyncError;

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Writes `bytes` for `(blob_hash, index)` and returns the
    /// backend-specific storage key, atomically.
    async fn write_chunk(&self, blob_hash: &str, index: i64, bytes: &[u8]) -> Result<String, ObsyncError>;

    /// Reads back the bytes previously written at `storage_key`.
    async fn read_chunk(&self, storage_key: &str) -> Result<Vec<u8>, ObsyncError>;
}

/// `{root}/blobs/{hash}/{index}.bin` layout (spec §6 persisted state
/// layout).
pub struct FilesystemChunkStore {
    root: PathBuf,
}

impl FilesystemChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FilesystemChunkStore { root: root.into() }
    }

    fn chunk_path(&self, blob_hash: &str, index: i64) -> PathBuf {
        self.root.join("blobs").join(blob_hash).join(format!("{}.bin", index))
    }

    fn storage_key(blob_hash: &str, index: i64) -> String {
        format!("blobs/{}/{}.bin", blob_hash, index)
    }

    fn path_for_key(&self, storage_key: &str) -> PathBuf {
        self.root.join(storage_key)
    }
}

/// Writes `bytes` to `path` via a sibling temp file plus atomic
/// rename, so a reader of `path` never observes a partial write. This
/// is the async equivalent of the teacher's
/// `tools::file_set_contents`, adapted to run entirely on Tokio's
/// async filesystem API instead of `nix::unistd::mkstemp`.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ObsyncError> {
    let parent = path.parent().ok_or_else(|| ObsyncError::internal("chunk path has no parent"))?;
    tokio::fs::create_dir_all(parent).await?;

    let mut tmp_path = parent.to_path_buf();
    let unique = format!(
        ".tmp-{}-{}",
        std::process::id(),
        SystemRandomSuffix::next()
    );
    tmp_path.push(unique);

    {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// A monotonic counter used only to make temp file names unique
/// within this process; not a security primitive.
struct SystemRandomSuffix;

impl SystemRandomSuffix {
    fn next() -> u64 {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        COUNTER.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl ChunkStore for FilesystemChunkStore {
    async fn write_chunk(&self, blob_hash: &str, index: i64, bytes: &[u8]) -> Result<String, ObsyncError> {
        let path = self.chunk_path(blob_hash, index);
        write_atomic(&path, bytes).await?;
        Ok(Self::storage_key(blob_hash, index))
    }

    async fn read_chunk(&self, storage_key: &str) -> Result<Vec<u8>, ObsyncError> {
        let path = self.path_for_key(storage_key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObsyncError::new(crate::error::Kind::ChunkNotFound, "chunk not found"))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// S3-compatible backend built on the `object_store` crate, the same
/// pluggable-backend crate the tvix/castore example pack uses for its
/// content-addressed blob store. Only enabled behind the `s3` feature
/// since it is not required for the local/self-hosted deployment this
/// core primarily targets.
#[cfg(feature = "s3")]
pub mod object_store_backend {
    use super::*;
    use object_store::path::Path as ObjectPath;
    use object_store::ObjectStore as _;
    use std::sync::Arc;

    pub struct ObjectStoreChunkStore {
        store: Arc<dyn object_store::ObjectStore>,
    }

    impl ObjectStoreChunkStore {
        pub fn new(store: Arc<dyn object_store::ObjectStore>) -> Self {
            ObjectStoreChunkStore { store }
        }

        fn object_path(blob_hash: &str, index: i64) -> ObjectPath {
            ObjectPath::from(format!("blobs/{}/{}.bin", blob_hash, index))
        }
    }

    #[async_trait]
    impl ChunkStore for ObjectStoreChunkStore {
        async fn write_chunk(&self, blob_hash: &str, index: i64, bytes: &[u8]) -> Result<String, ObsyncError> {
            let path = Self::object_path(blob_hash, index);
            self.store
                .put(&path, bytes.to_vec().into())
                .await
                .map_err(|e| ObsyncError::internal(format!("object store put failed: {}", e)))?;
            Ok(path.to_string())
        }

        async fn read_chunk(&self, storage_key: &str) -> Result<Vec<u8>, ObsyncError> {
            let path = ObjectPath::from(storage_key);
            let result = self
                .store
                .get(&path)
                .await
                .map_err(|_| ObsyncError::new(crate::error::Kind::ChunkNotFound, "chunk not found"))?;
            let bytes = result
                .bytes()
                .await
                .map_err(|e| ObsyncError::internal(format!("object store read failed: {}", e)))?;
            Ok(bytes.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_chunk_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemChunkStore::new(dir.path());
        let key = store.write_chunk("deadbeef", 0, b"hello world").await.unwrap();
        let bytes = store.read_chunk(&key).await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn missing_chunk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemChunkStore::new(dir.path());
        let err = store.read_chunk("blobs/nope/0.bin").await.unwrap_err();
        assert_eq!(err.kind.code(), "CHUNK_NOT_FOUND");
    }

    #[tokio::test]
    async fn rewriting_same_index_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemChunkStore::new(dir.path());
        let key = store.write_chunk("h", 0, b"first").await.unwrap();
        store.write_chunk("h", 0, b"second!!").await.unwrap();
        let bytes = store.read_chunk(&key).await.unwrap();
        assert_eq!(bytes, b"second!!");
    }
}
