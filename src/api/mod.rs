//! JSON request dispatch for the `/v1` endpoint table (spec §6).
//!
//! This is a hand-rolled router rather than the teacher's own
//! `proxmox::api::Router` macro table: that framework lives in a
//! sibling crate of the original workspace that is not part of this
//! core's dependency set, so routing here is plain method+path
//! matching over `hyper::Request`/`Response`, in the same style the
//! teacher's `api2/reader.rs` uses for the one handler it builds by
//! hand (the protocol-upgrade responder).

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;

use crate::access::Gate;
use crate::blob;
use crate::error::ObsyncError;
use crate::ids::VaultId;
use crate::principal::Principal;
use crate::realtime::Bus;
use crate::store::chunks::ChunkStore;
use crate::store::metadata::MetadataStore;
use crate::sync::{pull, push};

/// Everything a request handler needs, cheaply `Clone`-able so each
/// connection task can own one.
#[derive(Clone)]
pub struct AppState {
    pub store: MetadataStore,
    pub gate: Gate,
    pub bus: Bus,
    pub chunks: std::sync::Arc<dyn ChunkStore>,
}

fn status_for(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

pub fn error_response(err: &ObsyncError) -> Response<Body> {
    json_response(status_for(err.kind.http_status()), &err.envelope())
}

/// Reads and parses a JSON body, using `on_error` to build the
/// endpoint-specific `ObsyncError` (e.g. `invalid_blob_init_payload`
/// for `/blobs/init`) so a malformed body reports the right `code` in
/// the taxonomy (spec.md §7 / SPEC_FULL.md §7) instead of a generic one.
async fn read_json_body<T, F>(req: Request<Body>, on_error: F) -> Result<T, ObsyncError>
where
    T: DeserializeOwned,
    F: Fn(String) -> ObsyncError,
{
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| on_error(format!("failed to read body: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| on_error(format!("malformed JSON body: {}", e)))
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        if k == key {
            Some(v)
        } else {
            None
        }
    })
}

/// Path segments after `/v1/vaults/{vaultId}/`.
enum Route<'a> {
    SyncPush,
    SyncPull,
    BlobsInit,
    BlobChunk { hash: &'a str, index: i64 },
    BlobCommit { hash: &'a str },
    Blob { hash: &'a str },
}

fn parse_route<'a>(method: &Method, segments: &[&'a str]) -> Option<Route<'a>> {
    match (method, segments) {
        (&Method::POST, ["sync", "push"]) => Some(Route::SyncPush),
        (&Method::GET, ["sync", "pull"]) => Some(Route::SyncPull),
        (&Method::POST, ["blobs", "init"]) => Some(Route::BlobsInit),
        (&Method::PUT, ["blobs", hash, "chunks", index]) => {
            index.parse().ok().map(|index| Route::BlobChunk { hash, index })
        }
        (&Method::GET, ["blobs", hash, "chunks", index]) => {
            index.parse().ok().map(|index| Route::BlobChunk { hash, index })
        }
        (&Method::POST, ["blobs", hash, "commit"]) => Some(Route::BlobCommit { hash }),
        (&Method::GET, ["blobs", hash]) => Some(Route::Blob { hash }),
        _ => None,
    }
}

/// Dispatches every endpoint except the realtime WebSocket upgrade,
/// which `server::serve` intercepts before reaching here (it needs the
/// raw request to call `on_upgrade`).
pub async fn dispatch(
    state: &AppState,
    principal: &Principal,
    req: Request<Body>,
) -> Result<Response<Body>, ObsyncError> {
    let method = req.method().clone();
    let (path, query) = match req.uri().path_and_query() {
        Some(pq) => (pq.path().to_string(), pq.query().unwrap_or("").to_string()),
        None => (req.uri().path().to_string(), String::new()),
    };

    let mut segments = path.trim_matches('/').split('/');
    if segments.next() != Some("v1") || segments.next() != Some("vaults") {
        return Ok(json_response(StatusCode::NOT_FOUND, &json!({"code": "NOT_FOUND"})));
    }
    let vault_id_raw = segments.next().unwrap_or("");
    let vault_id: VaultId = vault_id_raw
        .parse()
        .map_err(|_| ObsyncError::vault_not_found())?;
    let rest: Vec<&str> = segments.collect();

    let route = parse_route(&method, &rest);

    match route {
        Some(Route::SyncPush) => {
            let request: push::PushRequest = read_json_body(req, ObsyncError::invalid_push_payload).await?;
            let resp = push::ingest(&state.store, &state.gate, &state.bus, vault_id, principal, request).await?;
            Ok(json_response(StatusCode::OK, &resp))
        }
        Some(Route::SyncPull) => {
            let since: i64 = query_param(&query, "since").and_then(|v| v.parse().ok()).unwrap_or(0);
            let limit: Option<i64> = query_param(&query, "limit").and_then(|v| v.parse().ok());
            let device_id = query_param(&query, "deviceId").and_then(|v| v.parse().ok());
            let resp = pull::pull(&state.store, &state.gate, vault_id, principal, since, limit, device_id).await?;
            Ok(json_response(StatusCode::OK, &resp))
        }
        Some(Route::BlobsInit) => {
            #[derive(serde::Deserialize)]
            struct InitBody {
                hash: String,
                size: i64,
                #[serde(rename = "chunkCount")]
                chunk_count: i64,
                #[serde(rename = "cipherAlg")]
                cipher_alg: String,
            }
            let body: InitBody = read_json_body(req, ObsyncError::invalid_blob_init_payload).await?;
            let resp = blob::init(
                &state.store,
                &state.gate,
                vault_id,
                principal,
                body.hash,
                body.size,
                body.chunk_count,
                body.cipher_alg,
            )
            .await?;
            Ok(json_response(StatusCode::CREATED, &resp))
        }
        Some(Route::BlobChunk { hash, index }) if method == Method::PUT => {
            #[derive(serde::Deserialize)]
            struct PutChunkBody {
                #[serde(rename = "chunkHash")]
                chunk_hash: String,
                #[allow(dead_code)]
                size: i64,
                #[serde(rename = "cipherTextBase64")]
                cipher_text_base64: String,
            }
            let body: PutChunkBody = read_json_body(req, ObsyncError::invalid_chunk_payload).await?;
            use base64::Engine;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&body.cipher_text_base64)
                .map_err(|e| ObsyncError::invalid_chunk_payload(format!("cipherTextBase64 is not valid base64: {}", e)))?;
            let resp = blob::put_chunk(
                &state.store,
                state.chunks.as_ref(),
                &state.gate,
                vault_id,
                principal,
                hash.to_string(),
                index,
                body.chunk_hash,
                &bytes,
            )
            .await?;
            Ok(json_response(StatusCode::OK, &resp))
        }
        Some(Route::BlobChunk { hash, index }) => {
            let resp = blob::get_chunk(&state.store, state.chunks.as_ref(), &state.gate, vault_id, principal, hash.to_string(), index).await?;
            Ok(json_response(StatusCode::OK, &resp))
        }
        Some(Route::BlobCommit { hash }) => {
            #[derive(serde::Deserialize)]
            struct CommitBody {
                hash: String,
                #[serde(rename = "expectedChunkCount")]
                expected_chunk_count: i64,
                #[serde(rename = "expectedSize")]
                expected_size: i64,
            }
            let body: CommitBody = read_json_body(req, ObsyncError::invalid_blob_commit_payload).await?;
            let resp = blob::commit(
                &state.store,
                &state.gate,
                vault_id,
                principal,
                hash.to_string(),
                body.hash,
                body.expected_chunk_count,
                body.expected_size,
            )
            .await?;
            Ok(json_response(StatusCode::OK, &resp))
        }
        Some(Route::Blob { hash }) => {
            let resp = blob::get_manifest(&state.store, &state.gate, vault_id, principal, hash.to_string()).await?;
            Ok(json_response(StatusCode::OK, &resp))
        }
        None => Ok(json_response(StatusCode::NOT_FOUND, &json!({"code": "NOT_FOUND"}))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_route_shape() {
        assert!(matches!(parse_route(&Method::POST, &["sync", "push"]), Some(Route::SyncPush)));
        assert!(matches!(parse_route(&Method::GET, &["sync", "pull"]), Some(Route::SyncPull)));
        assert!(matches!(parse_route(&Method::POST, &["blobs", "init"]), Some(Route::BlobsInit)));
        assert!(matches!(
            parse_route(&Method::PUT, &["blobs", "abc", "chunks", "0"]),
            Some(Route::BlobChunk { hash: "abc", index: 0 })
        ));
        assert!(matches!(parse_route(&Method::POST, &["blobs", "abc", "commit"]), Some(Route::BlobCommit { hash: "abc" })));
        assert!(matches!(parse_route(&Method::GET, &["blobs", "abc"]), Some(Route::Blob { hash: "abc" })));
        assert!(parse_route(&Method::GET, &["nope"]).is_none());
    }

    #[test]
    fn query_param_extracts_value() {
        assert_eq!(query_param("since=5&limit=10", "limit"), Some("10"));
        assert_eq!(query_param("since=5", "deviceId"), None);
    }
}
