//! Server configuration.
//!
//! Loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ServerConfig::default()`]
//! 2. **Config file**: JSON, deep-merged over defaults when the file exists
//! 3. **Environment variables**: `DUPLEX_*` overrides (highest priority)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value was present but unusable.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Configuration for the duplex server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Route serving the `WebSocket` upgrade.
    pub ws_path: String,
    /// Close a connection after this many seconds without inbound traffic.
    pub idle_timeout_secs: u64,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound frame queue.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ws_path: "/ws".into(),
            idle_timeout_secs: 30,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            outbound_buffer: 1024,
        }
    }
}

impl ServerConfig {
    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("idle_timeout_secs must be > 0".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue("outbound_buffer must be > 0".into()));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        if self.ws_path == "/health" {
            return Err(ConfigError::InvalidValue("ws_path collides with /health".into()));
        }
        Ok(())
    }
}

/// Load configuration from `path` with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge per key, arrays and primitives are replaced, and nulls in
/// `source` leave `target` untouched.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DUPLEX_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_with(config, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Invalid values are ignored.
pub fn apply_overrides_with(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("DUPLEX_HOST") {
        config.host = v;
    }
    if let Some(v) =
        read("DUPLEX_PORT").and_then(|v| checked(&v, "DUPLEX_PORT", parse_u16_range(&v, 0, 65535)))
    {
        config.port = v;
    }
    if let Some(v) = read("DUPLEX_WS_PATH").filter(|v| v.starts_with('/')) {
        config.ws_path = v;
    }
    if let Some(v) = read("DUPLEX_IDLE_TIMEOUT_SECS")
        .and_then(|v| checked(&v, "DUPLEX_IDLE_TIMEOUT_SECS", parse_u64_range(&v, 1, 86_400)))
    {
        config.idle_timeout_secs = v;
    }
    if let Some(v) = read("DUPLEX_MAX_MESSAGE_SIZE")
        .and_then(|v| checked(&v, "DUPLEX_MAX_MESSAGE_SIZE", parse_usize_range(&v, 1024, 1 << 30)))
    {
        config.max_message_size = v;
    }
}

fn checked<T>(raw: &str, key: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "invalid env var, ignoring");
    }
    parsed
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.ws_path, "/ws");
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port":3000}"#).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.idle_timeout_secs, 30);
    }

    #[test]
    fn merge_nested_override() {
        let merged = deep_merge(
            serde_json::json!({"server": {"port": 8080, "host": "localhost"}}),
            serde_json::json!({"server": {"port": 9090}}),
        );
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(serde_json::json!({"a": 1}), serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_array_replace() {
        let merged = deep_merge(serde_json::json!({"a": [1, 2]}), serde_json::json!({"a": [3]}));
        assert_eq!(merged["a"], serde_json::json!([3]));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = ServerConfig::default();
        apply_overrides_with(
            &mut cfg,
            lookup(&[
                ("DUPLEX_HOST", "0.0.0.0"),
                ("DUPLEX_PORT", "8443"),
                ("DUPLEX_IDLE_TIMEOUT_SECS", "120"),
                ("DUPLEX_WS_PATH", "/v1/websocket"),
            ]),
        );
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 8443);
        assert_eq!(cfg.idle_timeout_secs, 120);
        assert_eq!(cfg.ws_path, "/v1/websocket");
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut cfg = ServerConfig::default();
        apply_overrides_with(
            &mut cfg,
            lookup(&[
                ("DUPLEX_PORT", "not-a-port"),
                ("DUPLEX_IDLE_TIMEOUT_SECS", "0"),
                ("DUPLEX_MAX_MESSAGE_SIZE", "12"),
                ("DUPLEX_WS_PATH", "no-slash"),
                ("DUPLEX_HOST", ""),
            ]),
        );
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("80", 1, 65535), Some(80));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("99999999", 1, 86_400), None);
        assert_eq!(parse_usize_range("-1", 0, 10), None);
    }

    #[test]
    fn validate_rejects_zero_idle_timeout() {
        let cfg = ServerConfig {
            idle_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert_matches!(cfg.validate(), Err(ConfigError::InvalidValue(_)));
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.ws_path, ServerConfig::default().ws_path);
        assert_eq!(cfg.outbound_buffer, 1024);
    }

    #[test]
    fn load_file_merges_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duplex.json");
        std::fs::write(&path, r#"{"ws_path":"/v1/websocket/","outbound_buffer":8}"#).unwrap();
        let cfg = load_config_from_path(&path).unwrap();
        assert_eq!(cfg.ws_path, "/v1/websocket/");
        assert_eq!(cfg.outbound_buffer, 8);
        assert_eq!(cfg.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn load_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duplex.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_matches!(load_config_from_path(&path), Err(ConfigError::Json(_)));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duplex.json");
        std::fs::write(&path, r#"{"outbound_buffer":0}"#).unwrap();
        assert_matches!(load_config_from_path(&path), Err(ConfigError::InvalidValue(_)));
    }
}
