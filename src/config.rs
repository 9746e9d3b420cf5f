//! Process configuration.
//!
//! Mirrors the teacher's `buildcfg`/`configdir!` convention of naming
//! well-known paths as constants, but reads overrides from the
//! environment instead of being compiled in, since this core is meant
//! to be deployed self-hosted by a single operator rather than
//! packaged as a distro daemon.

use std::path::PathBuf;

/// Default bind address for the HTTP/WebSocket listener.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Default path of the SQLite metadata database.
pub const DEFAULT_DB_PATH: &str = "/var/lib/obsync/metadata.sqlite3";

/// Default root directory for the filesystem chunk store.
pub const DEFAULT_CHUNK_ROOT: &str = "/var/lib/obsync/chunks";

/// Hard ceiling on `sync/pull` `limit`, independent of what the
/// caller requests (spec §4.1, §6).
pub const MAX_PULL_LIMIT: i64 = 1000;

/// Default `sync/pull` limit when the caller does not specify one.
pub const DEFAULT_PULL_LIMIT: i64 = 200;

/// Hard ceiling on realtime backlog replay (spec §4.5, §6).
pub const MAX_REALTIME_BACKLOG: i64 = 500;

/// Keepalive interval for open realtime subscriptions (spec §4.5).
pub const KEEPALIVE_INTERVAL_SECS: u64 = 20;

/// Per-subscriber bounded channel capacity for the realtime bus
/// (spec §5 / §9: "fan-out via per-subscriber channel with bounded
/// buffer" is the preferred discipline).
pub const REALTIME_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub chunk_root: PathBuf,
}

impl Config {
    /// Loads configuration from the environment, falling back to the
    /// documented defaults above. `OBSYNC_BIND_ADDR`, `OBSYNC_DB_PATH`,
    /// and `OBSYNC_CHUNK_ROOT` are the only recognized overrides; this
    /// keeps the core dependency-free of a CLI/config-file parser the
    /// teacher repo does not use either for its equivalent settings.
    pub fn from_env() -> Self {
        Config {
            bind_addr: std::env::var("OBSYNC_BIND_ADDR")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            db_path: std::env::var("OBSYNC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH)),
            chunk_root: std::env::var("OBSYNC_CHUNK_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_CHUNK_ROOT)),
        }
    }
}
