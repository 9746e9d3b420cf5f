//! Logging setup, following the teacher's `log` + `env_logger` pairing.

/// Initializes the global logger. Safe to call more than once in
/// tests; subsequent calls are no-ops (`env_logger::try_init` ignores
/// the "already initialized" error).
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .try_init();
}

/// Redacts the legacy `?token=` query fallback (spec §6) before a URI
/// is written to any log line.
pub fn redact_query_token(uri: &str) -> String {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => return uri.to_string(),
    };

    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| {
            if let Some((key, _)) = pair.split_once('=') {
                if key.eq_ignore_ascii_case("token") {
                    return format!("{}=<redacted>", key);
                }
            }
            pair.to_string()
        })
        .collect();

    format!("{}?{}", path, redacted.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_token_query_param() {
        let uri = "/v1/vaults/x/realtime?since=0&token=supersecret";
        assert_eq!(
            redact_query_token(uri),
            "/v1/vaults/x/realtime?since=0&token=<redacted>"
        );
    }

    #[test]
    fn leaves_other_uris_untouched() {
        assert_eq!(redact_query_token("/v1/vaults/x/sync/pull?since=0"), "/v1/vaults/x/sync/pull?since=0");
    }
}
