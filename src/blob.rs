//! Blob Orchestrator (spec §4.6, C6): a three-phase content-addressed
//! upload protocol on top of the Chunk Object Store and Metadata
//! Store.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde_json::json;

use crate::access::Gate;
use crate::error::ObsyncError;
use crate::hashutil::sha256_hex;
use crate::ids::VaultId;
use crate::principal::{Principal, Scope};
use crate::store::chunks::ChunkStore;
use crate::store::metadata::MetadataStore;

const MIN_HASH_LEN: usize = 32;

static UPLOAD_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn fresh_upload_id() -> String {
    format!("upload-{:016x}", UPLOAD_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Serialize)]
pub struct InitResponse {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    pub hash: String,
    #[serde(rename = "missingIndices")]
    pub missing_indices: Vec<i64>,
}

/// Phase A (spec §4.6): declares a manifest and reports which chunk
/// indices are still needed.
pub async fn init(
    store: &MetadataStore,
    gate: &Gate,
    vault_id: VaultId,
    principal: &Principal,
    hash: String,
    size: i64,
    chunk_count: i64,
    cipher_alg: String,
) -> Result<InitResponse, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Write).await?;

    if hash.len() < MIN_HASH_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ObsyncError::invalid_blob_init_payload(
            "hash must be a hex digest of at least 32 characters",
        ));
    }
    if size <= 0 {
        return Err(ObsyncError::invalid_blob_init_payload("size must be > 0"));
    }
    if chunk_count <= 0 {
        return Err(ObsyncError::invalid_blob_init_payload("chunkCount must be > 0"));
    }

    store
        .upsert_blob_manifest(hash.clone(), size, chunk_count, cipher_alg)
        .await?;

    let existing = store.list_chunks(hash.clone()).await?;
    let present: std::collections::HashSet<i64> = existing.iter().map(|c| c.index).collect();
    let missing_indices = (0..chunk_count).filter(|i| !present.contains(i)).collect();

    Ok(InitResponse {
        upload_id: fresh_upload_id(),
        hash,
        missing_indices,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PutChunkResponse {
    #[serde(rename = "blobHash")]
    pub blob_hash: String,
    pub index: i64,
    pub persisted: bool,
}

/// Phase B (spec §4.6): verifies the chunk digest before anything is
/// written durably.
pub async fn put_chunk(
    store: &MetadataStore,
    chunk_store: &dyn ChunkStore,
    gate: &Gate,
    vault_id: VaultId,
    principal: &Principal,
    blob_hash: String,
    index: i64,
    chunk_hash: String,
    bytes: &[u8],
) -> Result<PutChunkResponse, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Write).await?;

    let computed = sha256_hex(bytes);
    if computed != chunk_hash {
        return Err(ObsyncError::chunk_hash_mismatch(format!(
            "computed digest {} does not match declared chunkHash {}",
            computed, chunk_hash
        )));
    }

    let storage_key = chunk_store.write_chunk(&blob_hash, index, bytes).await?;
    store
        .upsert_chunk(blob_hash.clone(), index, chunk_hash, bytes.len() as i64, storage_key)
        .await?;

    Ok(PutChunkResponse {
        blob_hash,
        index,
        persisted: true,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResponse {
    pub hash: String,
    pub committed: bool,
}

/// Phase C (spec §4.6): the asymmetric `<` completeness gate lets a
/// client upload more than it declared without being rejected.
pub async fn commit(
    store: &MetadataStore,
    gate: &Gate,
    vault_id: VaultId,
    principal: &Principal,
    blob_hash_in_url: String,
    payload_hash: String,
    expected_chunk_count: i64,
    expected_size: i64,
) -> Result<CommitResponse, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Write).await?;

    if payload_hash != blob_hash_in_url {
        return Err(ObsyncError::invalid_blob_commit_payload(
            "payload.hash must equal the blobHash in the URL",
        ));
    }

    let (count, sum_size) = store.count_chunks(blob_hash_in_url.clone()).await?;
    if count < expected_chunk_count || sum_size < expected_size {
        return Err(ObsyncError::blob_incomplete("blob is missing chunks or bytes").with_details(json!({
            "currentCount": count,
            "currentSize": sum_size,
            "expectedChunkCount": expected_chunk_count,
            "expectedSize": expected_size,
        })));
    }

    store.mark_blob_committed(blob_hash_in_url.clone()).await?;

    Ok(CommitResponse {
        hash: blob_hash_in_url,
        committed: true,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkSummary {
    pub index: i64,
    #[serde(rename = "chunkHash")]
    pub chunk_hash: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestView {
    pub hash: String,
    pub size: i64,
    #[serde(rename = "chunkCount")]
    pub chunk_count: i64,
    #[serde(rename = "cipherAlg")]
    pub cipher_alg: String,
    #[serde(rename = "committedAt")]
    pub committed_at: Option<i64>,
    pub chunks: Vec<ChunkSummary>,
}

/// Read path: a manifest that doesn't exist or isn't committed yet is
/// `BLOB_NOT_FOUND` either way, matching the init/commit lifecycle.
pub async fn get_manifest(
    store: &MetadataStore,
    gate: &Gate,
    vault_id: VaultId,
    principal: &Principal,
    hash: String,
) -> Result<ManifestView, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Read).await?;

    let manifest = store.lookup_blob(hash.clone()).await?.ok_or_else(ObsyncError::blob_not_found)?;
    if manifest.committed_at.is_none() {
        return Err(ObsyncError::blob_not_found());
    }

    let chunks = store
        .list_chunks(hash)
        .await?
        .into_iter()
        .map(|c| ChunkSummary {
            index: c.index,
            chunk_hash: c.chunk_hash,
            size: c.size,
        })
        .collect();

    Ok(ManifestView {
        hash: manifest.hash,
        size: manifest.size,
        chunk_count: manifest.chunk_count,
        cipher_alg: manifest.cipher_alg,
        committed_at: manifest.committed_at,
        chunks,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkView {
    #[serde(rename = "blobHash")]
    pub blob_hash: String,
    pub index: i64,
    #[serde(rename = "chunkHash")]
    pub chunk_hash: String,
    pub size: i64,
    /// Base64-wrapped ciphertext bytes (spec §6 wire shape).
    #[serde(rename = "cipherTextBase64")]
    pub cipher_text_base64: String,
}

pub async fn get_chunk(
    store: &MetadataStore,
    chunk_store: &dyn ChunkStore,
    gate: &Gate,
    vault_id: VaultId,
    principal: &Principal,
    blob_hash: String,
    index: i64,
) -> Result<ChunkView, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Read).await?;

    let (chunk_hash, storage_key, size) = store
        .lookup_chunk_storage_key(blob_hash.clone(), index)
        .await?
        .ok_or_else(|| ObsyncError::new(crate::error::Kind::ChunkNotFound, "chunk not found"))?;

    let bytes = chunk_store.read_chunk(&storage_key).await?;
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

    Ok(ChunkView {
        blob_hash,
        index,
        chunk_hash,
        size,
        cipher_text_base64: encoded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::AuthType;
    use crate::store::chunks::FilesystemChunkStore;
    use std::collections::HashSet;

    fn vid() -> VaultId {
        "11111111-1111-4111-8111-111111111111".parse().unwrap()
    }

    fn principal() -> Principal {
        Principal {
            user_id: "alice".to_string(),
            scopes: [Scope::Write, Scope::Read].into_iter().collect::<HashSet<_>>(),
            auth_type: AuthType::Bearer,
        }
    }

    async fn fixture() -> (MetadataStore, Gate, FilesystemChunkStore, tempfile::TempDir) {
        let store = MetadataStore::open_in_memory().unwrap();
        store.create_vault(vid(), "alice", "notes").await.unwrap();
        let gate = Gate::new(store.clone());
        let dir = tempfile::tempdir().unwrap();
        let chunks = FilesystemChunkStore::new(dir.path());
        (store, gate, chunks, dir)
    }

    fn hash32() -> String {
        "a".repeat(32)
    }

    #[tokio::test]
    async fn s3_blob_happy_path() {
        let (store, gate, chunks, _dir) = fixture().await;
        let hash = hash32();

        let init_resp = init(&store, &gate, vid(), &principal(), hash.clone(), 11, 1, "AES-256-GCM".into())
            .await
            .unwrap();
        assert_eq!(init_resp.missing_indices, vec![0]);

        let bytes = b"hello world";
        let chunk_hash = sha256_hex(bytes);
        let put_resp = put_chunk(&store, &chunks, &gate, vid(), &principal(), hash.clone(), 0, chunk_hash, bytes)
            .await
            .unwrap();
        assert!(put_resp.persisted);

        let commit_resp = commit(&store, &gate, vid(), &principal(), hash.clone(), hash.clone(), 1, 11)
            .await
            .unwrap();
        assert!(commit_resp.committed);

        let manifest = get_manifest(&store, &gate, vid(), &principal(), hash.clone()).await.unwrap();
        assert!(manifest.committed_at.is_some());

        let chunk = get_chunk(&store, &chunks, &gate, vid(), &principal(), hash, 0).await.unwrap();
        use base64::Engine;
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(chunk.cipher_text_base64).unwrap(),
            bytes
        );
    }

    #[tokio::test]
    async fn s4_commit_too_early_then_succeeds() {
        let (store, gate, chunks, _dir) = fixture().await;
        let hash = hash32();
        init(&store, &gate, vid(), &principal(), hash.clone(), 20, 2, "AES-256-GCM".into())
            .await
            .unwrap();

        let first = sha256_hex(b"only-chunk");
        put_chunk(&store, &chunks, &gate, vid(), &principal(), hash.clone(), 0, first, b"only-chunk")
            .await
            .unwrap();

        let err = commit(&store, &gate, vid(), &principal(), hash.clone(), hash.clone(), 2, 20)
            .await
            .unwrap_err();
        assert_eq!(err.kind.code(), "BLOB_INCOMPLETE");

        let second = sha256_hex(b"second-chunk");
        put_chunk(&store, &chunks, &gate, vid(), &principal(), hash.clone(), 1, second, b"second-chunk")
            .await
            .unwrap();

        let resp = commit(&store, &gate, vid(), &principal(), hash.clone(), hash, 2, 20)
            .await
            .unwrap();
        assert!(resp.committed);
    }

    #[tokio::test]
    async fn s5_chunk_hash_mismatch_leaves_nothing_written() {
        let (store, gate, chunks, _dir) = fixture().await;
        let hash = hash32();
        init(&store, &gate, vid(), &principal(), hash.clone(), 11, 1, "AES-256-GCM".into())
            .await
            .unwrap();

        let err = put_chunk(
            &store,
            &chunks,
            &gate,
            vid(),
            &principal(),
            hash.clone(),
            0,
            "not-the-real-digest".into(),
            b"hello world",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind.code(), "CHUNK_HASH_MISMATCH");

        let listed = store.list_chunks(hash).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn reupload_same_index_overwrites_idempotently() {
        let (store, gate, chunks, _dir) = fixture().await;
        let hash = hash32();
        init(&store, &gate, vid(), &principal(), hash.clone(), 5, 1, "AES-256-GCM".into())
            .await
            .unwrap();

        let h1 = sha256_hex(b"aaaaa");
        put_chunk(&store, &chunks, &gate, vid(), &principal(), hash.clone(), 0, h1, b"aaaaa")
            .await
            .unwrap();
        let h2 = sha256_hex(b"bbbbb");
        put_chunk(&store, &chunks, &gate, vid(), &principal(), hash.clone(), 0, h2, b"bbbbb")
            .await
            .unwrap();

        let (count, _) = store.count_chunks(hash).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rejects_hash_shorter_than_32_hex_chars() {
        let (store, gate, _chunks, _dir) = fixture().await;
        let err = init(&store, &gate, vid(), &principal(), "abc".into(), 10, 1, "AES-256-GCM".into())
            .await
            .unwrap_err();
        assert_eq!(err.kind.code(), "INVALID_BLOB_INIT_PAYLOAD");
    }

    #[tokio::test]
    async fn commit_rejects_mismatched_url_and_payload_hash() {
        let (store, gate, _chunks, _dir) = fixture().await;
        let hash = hash32();
        init(&store, &gate, vid(), &principal(), hash.clone(), 10, 1, "AES-256-GCM".into())
            .await
            .unwrap();
        let err = commit(&store, &gate, vid(), &principal(), hash, "different".repeat(4), 1, 10)
            .await
            .unwrap_err();
        assert_eq!(err.kind.code(), "INVALID_BLOB_COMMIT_PAYLOAD");
    }
}
