//! Push Ingestor (spec §4.3, C3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::Gate;
use crate::error::ObsyncError;
use crate::ids::{DeviceId, VaultId};
use crate::principal::{Principal, Scope};
use crate::realtime::{Bus, BusEvent};
use crate::store::metadata::{CursorPolicy, MetadataStore, OpType};

#[derive(Debug, Clone, Deserialize)]
pub struct PushOp {
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    #[serde(rename = "opType")]
    pub op_type: String,
    pub payload: Value,
    #[serde(rename = "fileId", default)]
    pub file_id: Option<String>,
    #[serde(rename = "authorDeviceId", default)]
    pub author_device_id: Option<String>,
    /// Opaque client-side causal metadata (spec §4.3): carried through
    /// but never consulted for ordering.
    #[serde(rename = "logicalClock", default)]
    pub logical_clock: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushRequest {
    #[serde(rename = "deviceId")]
    pub device_id: DeviceId,
    pub cursor: i64,
    pub ops: Vec<PushOp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MissingChunk {
    #[serde(rename = "blobHash")]
    pub blob_hash: String,
    pub index: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushResponse {
    #[serde(rename = "acknowledgedSeq")]
    pub acknowledged_seq: i64,
    #[serde(rename = "appliedCount")]
    pub applied_count: i64,
    #[serde(rename = "missingChunks")]
    pub missing_chunks: Vec<MissingChunk>,
    #[serde(rename = "rebaseRequired")]
    pub rebase_required: bool,
}

fn validate(request: &PushRequest) -> Result<(), ObsyncError> {
    if request.ops.is_empty() {
        return Err(ObsyncError::invalid_push_payload("ops must contain at least one operation"));
    }
    for (i, op) in request.ops.iter().enumerate() {
        if op.idempotency_key.is_empty() {
            return Err(ObsyncError::invalid_push_payload(format!(
                "ops[{}].idempotencyKey must not be empty",
                i
            )));
        }
        if OpType::parse(&op.op_type).is_none() {
            return Err(ObsyncError::invalid_push_payload(format!(
                "ops[{}].opType '{}' is not a recognized operation type",
                i, op.op_type
            )));
        }
    }
    Ok(())
}

/// Implements spec §4.3 steps 1-5.
pub async fn ingest(
    store: &MetadataStore,
    gate: &Gate,
    bus: &Bus,
    vault_id: VaultId,
    principal: &Principal,
    request: PushRequest,
) -> Result<PushResponse, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Write).await?;
    validate(&request)?;

    let mut applied_count = 0i64;
    let mut acknowledged_seq = 0i64;
    let mut missing_chunks = Vec::new();
    let mut published: Vec<BusEvent> = Vec::new();

    for op in &request.ops {
        let op_type = OpType::parse(&op.op_type).expect("validated above");

        let result = store
            .append_op(
                vault_id.clone(),
                op.file_id.clone(),
                op_type,
                op.payload.clone(),
                op.idempotency_key.clone(),
                op.author_device_id.clone(),
            )
            .await?;

        if result.was_new {
            applied_count += 1;
            published.push(BusEvent {
                vault_id: vault_id.clone(),
                seq: result.seq,
                op_type: op_type.as_str(),
                payload: op.payload.clone(),
                created_at: crate::store::metadata::now_millis(),
            });
        }

        if op_type == OpType::BlobRef {
            let blob_hash = op.payload.get("blobHash").and_then(Value::as_str);
            let index = op.payload.get("index").and_then(Value::as_i64).unwrap_or(0);
            if let Some(blob_hash) = blob_hash {
                let manifest = store.lookup_blob(blob_hash.to_string()).await?;
                let committed = manifest.map(|m| m.committed_at.is_some()).unwrap_or(false);
                if !committed {
                    missing_chunks.push(MissingChunk {
                        blob_hash: blob_hash.to_string(),
                        index,
                    });
                }
            }
        }

        acknowledged_seq = acknowledged_seq.max(result.seq);
    }

    store
        .upsert_cursor(&request.device_id, &vault_id, acknowledged_seq, CursorPolicy::Set)
        .await?;
    store.touch_device(&request.device_id, &principal.user_id).await?;

    // Publish only after every write in the batch has committed (spec
    // §4.3/§5 ordering guarantee), in ascending seq order.
    published.sort_by_key(|event| event.seq);
    for event in published {
        bus.publish(event);
    }

    Ok(PushResponse {
        acknowledged_seq,
        applied_count,
        missing_chunks,
        rebase_required: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vid() -> VaultId {
        "11111111-1111-4111-8111-111111111111".parse().unwrap()
    }

    fn principal(user: &str) -> Principal {
        Principal {
            user_id: user.to_string(),
            scopes: [Scope::Write, Scope::Read].into_iter().collect(),
            auth_type: crate::principal::AuthType::Bearer,
        }
    }

    async fn fixture() -> (MetadataStore, Gate, Bus) {
        let store = MetadataStore::open_in_memory().unwrap();
        store.create_vault(vid(), "alice", "notes").await.unwrap();
        let gate = Gate::new(store.clone());
        let bus = Bus::new();
        (store, gate, bus)
    }

    fn request(key: &str) -> PushRequest {
        PushRequest {
            device_id: "22222222-2222-4222-8222-222222222222".parse().unwrap(),
            cursor: 0,
            ops: vec![PushOp {
                idempotency_key: key.to_string(),
                op_type: "md_update".to_string(),
                payload: json!({"path": "a.md", "yUpdateBase64": "AQID"}),
                file_id: None,
                author_device_id: Some("22222222-2222-4222-8222-222222222222".to_string()),
                logical_clock: Some(1),
            }],
        }
    }

    #[tokio::test]
    async fn s1_push_pull_round_trip() {
        let (store, gate, bus) = fixture().await;
        let resp = ingest(&store, &gate, &bus, vid(), &principal("alice"), request("op-1"))
            .await
            .unwrap();
        assert_eq!(resp.acknowledged_seq, 1);
        assert_eq!(resp.applied_count, 1);
        assert!(resp.missing_chunks.is_empty());
        assert!(!resp.rebase_required);
    }

    #[tokio::test]
    async fn s2_replay_is_a_no_op() {
        let (store, gate, bus) = fixture().await;
        let first = ingest(&store, &gate, &bus, vid(), &principal("alice"), request("op-1"))
            .await
            .unwrap();
        let second = ingest(&store, &gate, &bus, vid(), &principal("alice"), request("op-1"))
            .await
            .unwrap();
        assert_eq!(second.applied_count, 0);
        assert_eq!(second.acknowledged_seq, first.acknowledged_seq);

        let ops = store.read_ops_since(vid(), 0, 1000).await.unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[tokio::test]
    async fn blob_ref_to_uncommitted_blob_is_flagged_missing() {
        let (store, gate, bus) = fixture().await;
        let mut req = request("op-blob");
        req.ops[0].op_type = "blob_ref".to_string();
        req.ops[0].payload = json!({"blobHash": "deadbeef", "index": 0});

        let resp = ingest(&store, &gate, &bus, vid(), &principal("alice"), req).await.unwrap();
        assert_eq!(resp.missing_chunks.len(), 1);
        assert_eq!(resp.missing_chunks[0].blob_hash, "deadbeef");
        // op is still recorded even though the blob is missing
        let ops = store.read_ops_since(vid(), 0, 1000).await.unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[tokio::test]
    async fn rejects_unrecognized_op_type() {
        let (store, gate, bus) = fixture().await;
        let mut req = request("op-1");
        req.ops[0].op_type = "not_a_real_type".to_string();
        let err = ingest(&store, &gate, &bus, vid(), &principal("alice"), req).await.unwrap_err();
        assert_eq!(err.kind.code(), "INVALID_PUSH_PAYLOAD");
    }

    #[tokio::test]
    async fn forbidden_without_write_scope() {
        let (store, gate, bus) = fixture().await;
        let read_only = Principal {
            user_id: "alice".to_string(),
            scopes: [Scope::Read].into_iter().collect(),
            auth_type: crate::principal::AuthType::Bearer,
        };
        let err = ingest(&store, &gate, &bus, vid(), &read_only, request("op-1")).await.unwrap_err();
        assert_eq!(err.kind.code(), "FORBIDDEN");
    }
}
