//! Error taxonomy for the sync core (spec §7).
//!
//! `ObsyncError` is the single error type every handler returns. Each
//! variant maps to one row of the taxonomy table: an HTTP status, a
//! stable `code`, and whether the client may blindly retry.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Unauthorized,
    Forbidden,
    VaultNotFound,
    InvalidPushPayload,
    InvalidBlobInitPayload,
    InvalidBlobCommitPayload,
    InvalidChunkPayload,
    ChunkHashMismatch,
    BlobIncomplete,
    BlobNotFound,
    ChunkNotFound,
    Internal,
}

impl Kind {
    pub fn code(self) -> &'static str {
        match self {
            Kind::Unauthorized => "UNAUTHORIZED",
            Kind::Forbidden => "FORBIDDEN",
            Kind::VaultNotFound => "VAULT_NOT_FOUND",
            Kind::InvalidPushPayload => "INVALID_PUSH_PAYLOAD",
            Kind::InvalidBlobInitPayload => "INVALID_BLOB_INIT_PAYLOAD",
            Kind::InvalidBlobCommitPayload => "INVALID_BLOB_COMMIT_PAYLOAD",
            Kind::InvalidChunkPayload => "INVALID_CHUNK_PAYLOAD",
            Kind::ChunkHashMismatch => "CHUNK_HASH_MISMATCH",
            Kind::BlobIncomplete => "BLOB_INCOMPLETE",
            Kind::BlobNotFound => "BLOB_NOT_FOUND",
            Kind::ChunkNotFound => "CHUNK_NOT_FOUND",
            Kind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Numeric HTTP status; kept as `u16` so this module does not need
    /// to depend on `http` just for a status code.
    pub fn http_status(self) -> u16 {
        match self {
            Kind::Unauthorized => 401,
            Kind::Forbidden => 403,
            Kind::VaultNotFound | Kind::BlobNotFound | Kind::ChunkNotFound => 404,
            Kind::InvalidPushPayload
            | Kind::InvalidBlobInitPayload
            | Kind::InvalidBlobCommitPayload
            | Kind::InvalidChunkPayload => 400,
            Kind::ChunkHashMismatch | Kind::BlobIncomplete => 409,
            Kind::Internal => 500,
        }
    }
}

#[derive(Error, Debug)]
pub struct ObsyncError {
    pub kind: Kind,
    pub message: String,
    pub remediation: Option<String>,
    pub details: Option<Value>,
    pub trace_id: Option<String>,
}

impl fmt::Display for ObsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl ObsyncError {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        ObsyncError {
            kind,
            message: message.into(),
            remediation: None,
            details: None,
            trace_id: None,
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(Kind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(Kind::Forbidden, message)
    }

    pub fn vault_not_found() -> Self {
        Self::new(Kind::VaultNotFound, "vault not found")
    }

    pub fn invalid_push_payload(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidPushPayload, message)
    }

    pub fn invalid_blob_init_payload(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidBlobInitPayload, message)
    }

    pub fn invalid_blob_commit_payload(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidBlobCommitPayload, message)
    }

    pub fn invalid_chunk_payload(message: impl Into<String>) -> Self {
        Self::new(Kind::InvalidChunkPayload, message)
    }

    pub fn chunk_hash_mismatch(message: impl Into<String>) -> Self {
        Self::new(Kind::ChunkHashMismatch, message)
    }

    pub fn blob_incomplete(message: impl Into<String>) -> Self {
        Self::new(Kind::BlobIncomplete, message)
    }

    pub fn blob_not_found() -> Self {
        Self::new(Kind::BlobNotFound, "blob not found")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Kind::Internal, message)
    }

    pub fn envelope(&self) -> ErrorEnvelope<'_> {
        ErrorEnvelope {
            code: self.kind.code(),
            message: &self.message,
            remediation: self.remediation.as_deref(),
            details: self.details.as_ref(),
            trace_id: self.trace_id.as_deref(),
        }
    }
}

#[derive(Serialize)]
pub struct ErrorEnvelope<'a> {
    pub code: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'a Value>,
    #[serde(rename = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<&'a str>,
}

/// Any store/IO failure that was not anticipated is fatal to the
/// in-flight request and surfaces as `INTERNAL_ERROR` (spec §4.1, §7).
/// This is logged at the call site with the trace id before being
/// converted, so no information is lost by collapsing it here.
impl From<rusqlite::Error> for ObsyncError {
    fn from(err: rusqlite::Error) -> Self {
        ObsyncError::internal(format!("metadata store error: {}", err))
    }
}

impl From<std::io::Error> for ObsyncError {
    fn from(err: std::io::Error) -> Self {
        ObsyncError::internal(format!("io error: {}", err))
    }
}

impl From<anyhow::Error> for ObsyncError {
    fn from(err: anyhow::Error) -> Self {
        ObsyncError::internal(format!("{}", err))
    }
}

impl From<tokio::task::JoinError> for ObsyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        ObsyncError::internal(format!("background task failed: {}", err))
    }
}
