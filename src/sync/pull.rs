//! Pull Service (spec §4.4, C4).

use serde::Serialize;
use serde_json::Value;

use crate::access::Gate;
use crate::config::{DEFAULT_PULL_LIMIT, MAX_PULL_LIMIT};
use crate::error::ObsyncError;
use crate::ids::{DeviceId, VaultId};
use crate::principal::{Principal, Scope};
use crate::store::metadata::{CursorPolicy, MetadataStore};

#[derive(Debug, Clone, Serialize)]
pub struct OpView {
    pub seq: i64,
    #[serde(rename = "opType")]
    pub op_type: &'static str,
    #[serde(rename = "fileId", skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    pub payload: Value,
    #[serde(rename = "idempotencyKey")]
    pub idempotency_key: String,
    #[serde(rename = "authorDeviceId", skip_serializing_if = "Option::is_none")]
    pub author_device_id: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullResponse {
    pub watermark: i64,
    pub ops: Vec<OpView>,
}

/// Implements spec §4.4 verbatim.
pub async fn pull(
    store: &MetadataStore,
    gate: &Gate,
    vault_id: VaultId,
    principal: &Principal,
    since: i64,
    limit: Option<i64>,
    device_id: Option<DeviceId>,
) -> Result<PullResponse, ObsyncError> {
    gate.admit(&vault_id, principal, Scope::Read).await?;

    let limit = limit.unwrap_or(DEFAULT_PULL_LIMIT).clamp(0, MAX_PULL_LIMIT);

    let ops = store.read_ops_since(vault_id.clone(), since, limit).await?;
    let watermark = ops.last().map(|op| op.seq).unwrap_or(since);

    if let Some(device_id) = &device_id {
        store
            .upsert_cursor(device_id, &vault_id, watermark, CursorPolicy::Max)
            .await?;
        store.touch_device(device_id, &principal.user_id).await?;
    }

    let ops = ops
        .into_iter()
        .map(|op| OpView {
            seq: op.seq,
            op_type: op.op_type.as_str(),
            file_id: op.file_id,
            payload: op.payload,
            idempotency_key: op.idempotency_key,
            author_device_id: op.author_device_id,
            created_at: op.created_at,
        })
        .collect();

    Ok(PullResponse { watermark, ops })
}
