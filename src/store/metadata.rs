//! Metadata Store (spec §4.1, C1).
//!
//! Backed by `rusqlite` in WAL mode behind a mutex-guarded connection:
//! SQLite already serializes writers, so a single shared handle is a
//! faithful stand-in for "the store's connection pool" the spec
//! describes in §5. Every call is dispatched through
//! `tokio::task::spawn_blocking` so no async task ever awaits while
//! holding the mutex, mirroring the way the teacher wraps its
//! synchronous `ReadChunk` behind an async `AsyncReadChunk` via
//! `spawn_blocking`/`tokio::fs`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::ObsyncError;
use crate::ids::{DeviceId, VaultId};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS vaults (
    id         TEXT PRIMARY KEY,
    owner      TEXT NOT NULL,
    name       TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    id            TEXT PRIMARY KEY,
    owner         TEXT NOT NULL,
    display_name  TEXT,
    public_key    TEXT,
    last_seen_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS op_log (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    vault_id          TEXT NOT NULL,
    file_id           TEXT,
    op_type           TEXT NOT NULL,
    payload           TEXT NOT NULL,
    idempotency_key   TEXT NOT NULL UNIQUE,
    author_device_id  TEXT,
    created_at        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS op_log_vault_seq ON op_log(vault_id, seq);

CREATE TABLE IF NOT EXISTS sync_cursors (
    device_id         TEXT NOT NULL,
    vault_id          TEXT NOT NULL,
    last_applied_seq  INTEGER NOT NULL,
    PRIMARY KEY (device_id, vault_id)
);

CREATE TABLE IF NOT EXISTS blobs (
    hash          TEXT PRIMARY KEY,
    size          INTEGER NOT NULL,
    chunk_count   INTEGER NOT NULL,
    cipher_alg    TEXT NOT NULL,
    committed_at  INTEGER
);

CREATE TABLE IF NOT EXISTS blob_chunks (
    blob_hash    TEXT NOT NULL,
    idx          INTEGER NOT NULL,
    chunk_hash   TEXT NOT NULL,
    size         INTEGER NOT NULL,
    storage_key  TEXT NOT NULL,
    PRIMARY KEY (blob_hash, idx)
);

CREATE INDEX IF NOT EXISTS blob_chunks_hash ON blob_chunks(blob_hash);

CREATE TABLE IF NOT EXISTS key_envelopes (
    vault_id              TEXT NOT NULL,
    device_id             TEXT NOT NULL,
    version               INTEGER NOT NULL,
    encrypted_vault_key   TEXT NOT NULL,
    PRIMARY KEY (vault_id, device_id, version)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPolicy {
    Set,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    MdUpdate,
    FileCreate,
    FileRename,
    FileDelete,
    BlobRef,
    KeyRotate,
}

impl OpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OpType::MdUpdate => "md_update",
            OpType::FileCreate => "file_create",
            OpType::FileRename => "file_rename",
            OpType::FileDelete => "file_delete",
            OpType::BlobRef => "blob_ref",
            OpType::KeyRotate => "key_rotate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "md_update" => OpType::MdUpdate,
            "file_create" => OpType::FileCreate,
            "file_rename" => OpType::FileRename,
            "file_delete" => OpType::FileDelete,
            "blob_ref" => OpType::BlobRef,
            "key_rotate" => OpType::KeyRotate,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Op {
    pub seq: i64,
    pub vault_id: VaultId,
    pub file_id: Option<String>,
    pub op_type: OpType,
    pub payload: Value,
    pub idempotency_key: String,
    pub author_device_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct AppendResult {
    pub seq: i64,
    pub was_new: bool,
}

#[derive(Debug, Clone)]
pub struct BlobManifest {
    pub hash: String,
    pub size: i64,
    pub chunk_count: i64,
    pub cipher_alg: String,
    pub committed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub index: i64,
    pub chunk_hash: String,
    pub size: i64,
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The Metadata Store (spec §4.1). Cheaply `Clone`-able; all clones
/// share the same underlying connection.
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self, ObsyncError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ObsyncError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, ObsyncError> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(MetadataStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, ObsyncError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, ObsyncError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("metadata store mutex poisoned");
            f(&guard)
        })
        .await?
    }

    pub async fn lookup_vault_owner(&self, vault_id: VaultId) -> Result<Option<String>, ObsyncError> {
        self.with_conn(move |conn| {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT owner FROM vaults WHERE id = ?1",
                    params![vault_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(owner)
        })
        .await
    }

    pub async fn create_vault(&self, vault_id: VaultId, owner: &str, name: &str) -> Result<(), ObsyncError> {
        let owner = owner.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO vaults (id, owner, name, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO NOTHING",
                params![vault_id.as_str(), owner, name, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn touch_device(&self, device_id: &DeviceId, owner: &str) -> Result<(), ObsyncError> {
        let device_id = device_id.as_str().to_string();
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO devices (id, owner, last_seen_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
                params![device_id, owner, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// `AppendOp` (spec §4.1): idempotency-key conflicts are resolved
    /// inside a single transaction so a concurrent duplicate push can
    /// never observe two different `seq` values for the same key.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_op(
        &self,
        vault_id: VaultId,
        file_id: Option<String>,
        op_type: OpType,
        payload: Value,
        idempotency_key: String,
        author_device_id: Option<String>,
    ) -> Result<AppendResult, ObsyncError> {
        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT seq FROM op_log WHERE idempotency_key = ?1",
                    params![idempotency_key],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(seq) = existing {
                tx.commit()?;
                return Ok(AppendResult { seq, was_new: false });
            }

            let payload_text = serde_json::to_string(&payload)
                .map_err(|e| ObsyncError::internal(format!("payload encode failed: {}", e)))?;

            tx.execute(
                "INSERT INTO op_log (vault_id, file_id, op_type, payload, idempotency_key, author_device_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    vault_id.as_str(),
                    file_id,
                    op_type.as_str(),
                    payload_text,
                    idempotency_key,
                    author_device_id,
                    now_millis(),
                ],
            )?;
            let seq = tx.last_insert_rowid();
            tx.commit()?;

            Ok(AppendResult { seq, was_new: true })
        })
        .await
    }

    /// `ReadOpsSince` (spec §4.1): ordered by `seq` ascending, capped
    /// at `min(limit, 1000)`.
    pub async fn read_ops_since(
        &self,
        vault_id: VaultId,
        since_seq: i64,
        limit: i64,
    ) -> Result<Vec<Op>, ObsyncError> {
        let limit = limit.min(crate::config::MAX_PULL_LIMIT).max(0);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, vault_id, file_id, op_type, payload, idempotency_key, author_device_id, created_at
                 FROM op_log WHERE vault_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3",
            )?;
            let rows = stmt.query_map(params![vault_id.as_str(), since_seq, limit], |row| {
                let op_type_str: String = row.get(3)?;
                let payload_str: String = row.get(4)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    op_type_str,
                    payload_str,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })?;

            let mut ops = Vec::new();
            for row in rows {
                let (seq, vault_id, file_id, op_type_str, payload_str, idempotency_key, author_device_id, created_at) = row?;
                let op_type = OpType::parse(&op_type_str)
                    .ok_or_else(|| ObsyncError::internal(format!("corrupt op_type '{}'", op_type_str)))?;
                let payload: Value = serde_json::from_str(&payload_str)
                    .map_err(|e| ObsyncError::internal(format!("payload decode failed: {}", e)))?;
                ops.push(Op {
                    seq,
                    vault_id: vault_id.parse().map_err(ObsyncError::from)?,
                    file_id,
                    op_type,
                    payload,
                    idempotency_key,
                    author_device_id,
                    created_at,
                });
            }
            Ok(ops)
        })
        .await
    }

    /// `UpsertCursor` (spec §4.1).
    pub async fn upsert_cursor(
        &self,
        device_id: &DeviceId,
        vault_id: &VaultId,
        seq: i64,
        policy: CursorPolicy,
    ) -> Result<(), ObsyncError> {
        let device_id = device_id.as_str().to_string();
        let vault_id = vault_id.as_str().to_string();
        self.with_conn(move |conn| {
            match policy {
                CursorPolicy::Set => {
                    conn.execute(
                        "INSERT INTO sync_cursors (device_id, vault_id, last_applied_seq) VALUES (?1, ?2, ?3)
                         ON CONFLICT(device_id, vault_id) DO UPDATE SET last_applied_seq = excluded.last_applied_seq",
                        params![device_id, vault_id, seq],
                    )?;
                }
                CursorPolicy::Max => {
                    conn.execute(
                        "INSERT INTO sync_cursors (device_id, vault_id, last_applied_seq) VALUES (?1, ?2, ?3)
                         ON CONFLICT(device_id, vault_id) DO UPDATE SET last_applied_seq = MAX(last_applied_seq, excluded.last_applied_seq)",
                        params![device_id, vault_id, seq],
                    )?;
                }
            }
            Ok(())
        })
        .await
    }

    pub async fn get_cursor(&self, device_id: &DeviceId, vault_id: &VaultId) -> Result<i64, ObsyncError> {
        let device_id = device_id.as_str().to_string();
        let vault_id = vault_id.as_str().to_string();
        self.with_conn(move |conn| {
            let seq: Option<i64> = conn
                .query_row(
                    "SELECT last_applied_seq FROM sync_cursors WHERE device_id = ?1 AND vault_id = ?2",
                    params![device_id, vault_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seq.unwrap_or(0))
        })
        .await
    }

    /// `UpsertBlobManifest` (spec §4.1): no-op if already present.
    pub async fn upsert_blob_manifest(
        &self,
        hash: String,
        size: i64,
        chunk_count: i64,
        cipher_alg: String,
    ) -> Result<(), ObsyncError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO blobs (hash, size, chunk_count, cipher_alg, committed_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)
                 ON CONFLICT(hash) DO NOTHING",
                params![hash, size, chunk_count, cipher_alg],
            )?;
            Ok(())
        })
        .await
    }

    /// `UpsertChunk` (spec §4.1): replace-on-conflict is intentional.
    pub async fn upsert_chunk(
        &self,
        blob_hash: String,
        index: i64,
        chunk_hash: String,
        size: i64,
        storage_key: String,
    ) -> Result<(), ObsyncError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO blob_chunks (blob_hash, idx, chunk_hash, size, storage_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(blob_hash, idx) DO UPDATE SET
                    chunk_hash = excluded.chunk_hash,
                    size = excluded.size,
                    storage_key = excluded.storage_key",
                params![blob_hash, index, chunk_hash, size, storage_key],
            )?;
            Ok(())
        })
        .await
    }

    /// `CountChunks` (spec §4.1).
    pub async fn count_chunks(&self, blob_hash: String) -> Result<(i64, i64), ObsyncError> {
        self.with_conn(move |conn| {
            let (count, sum): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), SUM(size) FROM blob_chunks WHERE blob_hash = ?1",
                params![blob_hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok((count, sum.unwrap_or(0)))
        })
        .await
    }

    /// `MarkBlobCommitted` (spec §4.1).
    pub async fn mark_blob_committed(&self, hash: String) -> Result<(), ObsyncError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE blobs SET committed_at = ?2 WHERE hash = ?1 AND committed_at IS NULL",
                params![hash, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// `LookupBlob` (spec §4.1).
    pub async fn lookup_blob(&self, hash: String) -> Result<Option<BlobManifest>, ObsyncError> {
        self.with_conn(move |conn| {
            let manifest = conn
                .query_row(
                    "SELECT hash, size, chunk_count, cipher_alg, committed_at FROM blobs WHERE hash = ?1",
                    params![hash],
                    |row| {
                        Ok(BlobManifest {
                            hash: row.get(0)?,
                            size: row.get(1)?,
                            chunk_count: row.get(2)?,
                            cipher_alg: row.get(3)?,
                            committed_at: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(manifest)
        })
        .await
    }

    /// `ListChunks` (spec §4.1): ordered by `index`.
    pub async fn list_chunks(&self, blob_hash: String) -> Result<Vec<ChunkRow>, ObsyncError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idx, chunk_hash, size FROM blob_chunks WHERE blob_hash = ?1 ORDER BY idx ASC",
            )?;
            let rows = stmt.query_map(params![blob_hash], |row| {
                Ok(ChunkRow {
                    index: row.get(0)?,
                    chunk_hash: row.get(1)?,
                    size: row.get(2)?,
                })
            })?;
            let mut chunks = Vec::new();
            for row in rows {
                chunks.push(row?);
            }
            Ok(chunks)
        })
        .await
    }

    /// `PutKeyEnvelope` (spec §3): an opaque pass-through write into
    /// `key_envelopes`. No §6 endpoint calls this; it exists only so a
    /// future key-management collaborator has somewhere to write.
    pub async fn put_key_envelope(
        &self,
        vault_id: VaultId,
        device_id: DeviceId,
        version: i64,
        encrypted_vault_key: String,
    ) -> Result<(), ObsyncError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO key_envelopes (vault_id, device_id, version, encrypted_vault_key)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(vault_id, device_id, version) DO UPDATE SET
                    encrypted_vault_key = excluded.encrypted_vault_key",
                params![vault_id.as_str(), device_id.as_str(), version, encrypted_vault_key],
            )?;
            Ok(())
        })
        .await
    }

    /// `GetKeyEnvelope` (spec §3): the read side of the same pass-through.
    pub async fn get_key_envelope(
        &self,
        vault_id: VaultId,
        device_id: DeviceId,
        version: i64,
    ) -> Result<Option<String>, ObsyncError> {
        self.with_conn(move |conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT encrypted_vault_key FROM key_envelopes
                     WHERE vault_id = ?1 AND device_id = ?2 AND version = ?3",
                    params![vault_id.as_str(), device_id.as_str(), version],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    pub async fn lookup_chunk_storage_key(
        &self,
        blob_hash: String,
        index: i64,
    ) -> Result<Option<(String, String, i64)>, ObsyncError> {
        self.with_conn(move |conn| {
            let row: Option<(String, String, i64)> = conn
                .query_row(
                    "SELECT chunk_hash, storage_key, size FROM blob_chunks WHERE blob_hash = ?1 AND idx = ?2",
                    params![blob_hash, index],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            Ok(row)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vid() -> VaultId {
        "11111111-1111-4111-8111-111111111111".parse().unwrap()
    }

    fn did() -> DeviceId {
        "22222222-2222-4222-8222-222222222222".parse().unwrap()
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let store = MetadataStore::open_in_memory().unwrap();
        let r1 = store
            .append_op(vid(), None, OpType::MdUpdate, json!({"a": 1}), "k1".into(), None)
            .await
            .unwrap();
        assert!(r1.was_new);

        let r2 = store
            .append_op(vid(), None, OpType::MdUpdate, json!({"a": 1}), "k1".into(), None)
            .await
            .unwrap();
        assert!(!r2.was_new);
        assert_eq!(r1.seq, r2.seq);
    }

    #[tokio::test]
    async fn seq_is_monotonic_per_vault() {
        let store = MetadataStore::open_in_memory().unwrap();
        for i in 0..5 {
            store
                .append_op(vid(), None, OpType::MdUpdate, json!({}), format!("k{}", i), None)
                .await
                .unwrap();
        }
        let ops = store.read_ops_since(vid(), 0, 1000).await.unwrap();
        let seqs: Vec<i64> = ops.iter().map(|o| o.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        assert_eq!(seqs, sorted);
        for w in seqs.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[tokio::test]
    async fn cursor_max_policy_never_regresses() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_cursor(&did(), &vid(), 10, CursorPolicy::Max).await.unwrap();
        store.upsert_cursor(&did(), &vid(), 5, CursorPolicy::Max).await.unwrap();
        assert_eq!(store.get_cursor(&did(), &vid()).await.unwrap(), 10);

        store.upsert_cursor(&did(), &vid(), 20, CursorPolicy::Max).await.unwrap();
        assert_eq!(store.get_cursor(&did(), &vid()).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn cursor_set_policy_replaces() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_cursor(&did(), &vid(), 10, CursorPolicy::Set).await.unwrap();
        store.upsert_cursor(&did(), &vid(), 3, CursorPolicy::Set).await.unwrap();
        assert_eq!(store.get_cursor(&did(), &vid()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn blob_manifest_upsert_is_noop_when_present() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .upsert_blob_manifest("h".into(), 10, 2, "AES-256-GCM".into())
            .await
            .unwrap();
        store
            .upsert_blob_manifest("h".into(), 999, 999, "OTHER".into())
            .await
            .unwrap();
        let manifest = store.lookup_blob("h".into()).await.unwrap().unwrap();
        assert_eq!(manifest.size, 10);
        assert_eq!(manifest.chunk_count, 2);
    }

    #[tokio::test]
    async fn commit_gate_counts_chunks() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .upsert_chunk("h".into(), 0, "ch0".into(), 5, "key0".into())
            .await
            .unwrap();
        let (count, sum) = store.count_chunks("h".into()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(sum, 5);

        // replace-on-conflict: re-upload same index doesn't double count
        store
            .upsert_chunk("h".into(), 0, "ch0b".into(), 7, "key0b".into())
            .await
            .unwrap();
        let (count, sum) = store.count_chunks("h".into()).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(sum, 7);
    }

    #[tokio::test]
    async fn key_envelope_is_a_plain_pass_through() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert_eq!(store.get_key_envelope(vid(), did(), 1).await.unwrap(), None);

        store
            .put_key_envelope(vid(), did(), 1, "ciphertext-v1".into())
            .await
            .unwrap();
        assert_eq!(
            store.get_key_envelope(vid(), did(), 1).await.unwrap(),
            Some("ciphertext-v1".to_string())
        );

        // same (vault, device, version) overwrites rather than conflicting
        store
            .put_key_envelope(vid(), did(), 1, "ciphertext-v1-rotated".into())
            .await
            .unwrap();
        assert_eq!(
            store.get_key_envelope(vid(), did(), 1).await.unwrap(),
            Some("ciphertext-v1-rotated".to_string())
        );
    }
}
