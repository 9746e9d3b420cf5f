//! HTTP bootstrap and the realtime WebSocket upgrade handler.
//!
//! The upgrade mechanics mirror the teacher's own
//! `api2::reader::upgrade_to_backup_reader_protocol`: validate the
//! `Upgrade` header, call `req.on_upgrade()`, and answer with a `101
//! Switching Protocols` response built by hand rather than through a
//! framework macro. Here the upgraded connection is driven by
//! `tokio-tungstenite` (a real WebSocket, not the teacher's private
//! H2-over-upgrade protocol) since the wire framing in spec §4.5 is
//! JSON text frames over a standard WebSocket.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::time::{interval, Duration};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::api::{self, AppState};
use crate::config::KEEPALIVE_INTERVAL_SECS;
use crate::error::ObsyncError;
use crate::ids::VaultId;
use crate::principal::{AuthType, Principal, PrincipalResolver};
use crate::realtime::Envelope;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

static TRACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A `u64` counter rendered as hex is enough of a trace id here:
/// distributed tracing is out of scope (spec §7), this just lets one
/// error response be matched back to its log line.
fn next_trace_id() -> String {
    format!("{:x}", TRACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Stamps `err` with a trace id and, for `Kind::Internal`, logs it at
/// `error!` before turning it into a response (spec §7 propagation
/// policy: unexpected failures are logged server-side with the trace
/// id and never echoed back beyond the generic message).
fn respond_error(trace_id: &str, err: ObsyncError) -> Response<Body> {
    if err.kind == crate::error::Kind::Internal {
        log::error!("trace={} {}", trace_id, err);
    }
    let err = err.with_trace_id(trace_id.to_string());
    api::error_response(&err)
}

fn websocket_accept_key(client_key: &str) -> String {
    use base64::Engine;
    let mut input = client_key.as_bytes().to_vec();
    input.extend_from_slice(WEBSOCKET_GUID.as_bytes());
    let digest = openssl::sha::sha1(&input);
    base64::engine::general_purpose::STANDARD.encode(digest)
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

/// Resolves the `Principal` for one request, trying the three carriers
/// spec §6 allows: bearer header, WebSocket subprotocol list, and the
/// legacy query-parameter fallback.
fn resolve_principal(
    req: &Request<Body>,
    resolver: &dyn PrincipalResolver,
) -> Result<Principal, ObsyncError> {
    if let Some(header) = req.headers().get(hyper::header::AUTHORIZATION) {
        let value = header.to_str().unwrap_or("");
        if let Some(token) = value.strip_prefix("Bearer ") {
            return resolver
                .resolve(token, AuthType::Bearer)
                .map_err(|e| ObsyncError::unauthorized(e.to_string()));
        }
    }

    if let Some(header) = req.headers().get("sec-websocket-protocol") {
        let value = header.to_str().unwrap_or("");
        let mut parts = value.split(',').map(str::trim);
        if parts.next() == Some("obsync-auth") {
            if let Some(token) = parts.next() {
                return resolver
                    .resolve(token, AuthType::WebSocketSubprotocol)
                    .map_err(|e| ObsyncError::unauthorized(e.to_string()));
            }
        }
    }

    if let Some(query) = req.uri().query() {
        if let Some(token) = query_param(query, "token") {
            return resolver
                .resolve(token, AuthType::LegacyQueryToken)
                .map_err(|e| ObsyncError::unauthorized(e.to_string()));
        }
    }

    Err(ObsyncError::unauthorized("no credential presented"))
}

fn is_websocket_upgrade(req: &Request<Body>) -> bool {
    let upgrade_hdr = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_hdr = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_hdr && connection_hdr
}

/// Drives one realtime subscriber's socket: backlog, then a select
/// loop between bus events, the keepalive interval, and inbound close
/// frames (spec §4.5 steps 2-5).
async fn drive_realtime_socket(
    state: AppState,
    vault_id: VaultId,
    since: i64,
    ws: WebSocketStream<hyper::upgrade::Upgraded>,
) {
    let (mut sink, mut stream) = ws.split();

    // Subscribe before taking the backlog snapshot: a publish that lands in
    // the gap between the two is then both in the backlog and on the
    // channel, so the dedup-by-watermark check below drops the duplicate
    // instead of the subscriber missing it.
    let mut subscription = state.bus.subscribe(vault_id.clone());

    let backlog = match state
        .store
        .read_ops_since(vault_id, since, crate::config::MAX_REALTIME_BACKLOG)
        .await
    {
        Ok(ops) => ops,
        Err(err) => {
            log::error!("realtime backlog read failed: {}", err);
            let envelope = Envelope::Error {
                code: err.kind.code(),
                message: err.message.clone(),
                remediation: err.remediation.clone(),
            };
            let _ = send_envelope(&mut sink, &envelope).await;
            return;
        }
    };

    let mut watermark = backlog.last().map(|op| op.seq).unwrap_or(since);
    let backlog_envelope = Envelope::Backlog {
        events: backlog.iter().map(Into::into).collect(),
    };
    if send_envelope(&mut sink, &backlog_envelope).await.is_err() {
        return;
    }

    let mut keepalive = interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS));
    keepalive.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            event = subscription.receiver.recv() => {
                match event {
                    Some(event) if event.seq <= watermark => {
                        // already covered by the backlog snapshot
                    }
                    Some(event) => {
                        watermark = event.seq;
                        let envelope = Envelope::Event {
                            vault_id: event.vault_id.to_string(),
                            seq: event.seq,
                            op_type: event.op_type,
                            payload: event.payload,
                            created_at: event.created_at,
                        };
                        if send_envelope(&mut sink, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = keepalive.tick() => {
                let envelope = Envelope::Keepalive { ts: crate::store::metadata::now_millis() };
                if send_envelope(&mut sink, &envelope).await.is_err() {
                    break;
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(envelope).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}

/// Handles `GET /v1/vaults/{vaultId}/realtime` specifically: validates
/// the upgrade handshake, admits the principal, and answers `101`
/// before handing the rest of the connection to
/// `drive_realtime_socket`.
async fn handle_realtime_upgrade(
    state: AppState,
    vault_id: VaultId,
    principal: Principal,
    since: i64,
    mut req: Request<Body>,
) -> Result<Response<Body>, ObsyncError> {
    state.gate.admit(&vault_id, &principal, crate::principal::Scope::Read).await?;

    let client_key = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ObsyncError::invalid_push_payload("missing Sec-WebSocket-Key header"))?
        .to_string();
    let accept_key = websocket_accept_key(&client_key);

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, None).await;
                drive_realtime_socket(state, vault_id, since, ws).await;
            }
            Err(err) => log::error!("realtime upgrade failed: {}", err),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, HeaderValue::from_static("websocket"))
        .header(CONNECTION, HeaderValue::from_static("Upgrade"))
        .header("sec-websocket-accept", accept_key)
        .header("sec-websocket-protocol", "obsync-auth")
        .body(Body::empty())
        .map_err(|e| ObsyncError::internal(format!("failed to build upgrade response: {}", e)))
}

fn realtime_vault_id(path: &str) -> Option<VaultId> {
    let mut segments = path.trim_matches('/').split('/');
    if segments.next() != Some("v1") || segments.next() != Some("vaults") {
        return None;
    }
    let vault_id = segments.next()?;
    if segments.next() != Some("realtime") || segments.next().is_some() {
        return None;
    }
    vault_id.parse().ok()
}

async fn route_request(
    state: AppState,
    resolver: Arc<dyn PrincipalResolver>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    let trace_id = next_trace_id();
    let path = req.uri().path().to_string();
    log::info!(
        "trace={} {} {}",
        trace_id,
        req.method(),
        crate::logging::redact_query_token(&req.uri().to_string())
    );

    if req.method() == Method::GET && is_websocket_upgrade(&req) {
        if let Some(vault_id) = realtime_vault_id(&path) {
            let principal = match resolve_principal(&req, resolver.as_ref()) {
                Ok(p) => p,
                Err(err) => return Ok(respond_error(&trace_id, err)),
            };
            let since = req
                .uri()
                .query()
                .and_then(|q| query_param(q, "since"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return Ok(match handle_realtime_upgrade(state, vault_id, principal, since, req).await {
                Ok(resp) => resp,
                Err(err) => respond_error(&trace_id, err),
            });
        }
    }

    let principal = match resolve_principal(&req, resolver.as_ref()) {
        Ok(p) => p,
        Err(err) => return Ok(respond_error(&trace_id, err)),
    };

    Ok(match api::dispatch(&state, &principal, req).await {
        Ok(resp) => resp,
        Err(err) => respond_error(&trace_id, err),
    })
}

/// Runs the server until the process is signaled to shut down. Request
/// cancellation (client disconnect) is handled by `hyper` dropping the
/// in-flight response future; realtime subscriptions release their bus
/// slot via `Subscription`'s `Drop` impl regardless (spec §5).
pub async fn serve(
    bind_addr: SocketAddr,
    state: AppState,
    resolver: Arc<dyn PrincipalResolver>,
) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        let resolver = resolver.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                route_request(state.clone(), resolver.clone(), req)
            }))
        }
    });

    log::info!("listening on {}", bind_addr);
    Server::bind(&bind_addr)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Resolves once an interrupt/terminate signal arrives, so
/// `with_graceful_shutdown` stops accepting new connections and lets
/// in-flight requests (including realtime subscribers) finish.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => log::error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    log::info!("shutdown signal received, draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_vault_id_from_realtime_path() {
        let id = realtime_vault_id("/v1/vaults/11111111-1111-4111-8111-111111111111/realtime").unwrap();
        assert_eq!(id.as_str(), "11111111-1111-4111-8111-111111111111");
    }

    #[test]
    fn rejects_unrelated_paths() {
        assert!(realtime_vault_id("/v1/vaults/11111111-1111-4111-8111-111111111111/sync/pull").is_none());
    }

    #[test]
    fn computes_rfc6455_example_accept_key() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(websocket_accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }
}
