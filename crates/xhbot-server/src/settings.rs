//! Server settings with layered sources.
//!
//! Loading flow:
//! 1. Start with compiled [`ServerSettings::default()`]
//! 2. If a settings file exists (`~/.xhbot/settings.json` unless a path is
//!    given), deep-merge its values over the defaults
//! 3. Apply `XHBOT_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::registry::{is_valid_namespace, DEFAULT_NAMESPACE};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Namespace for connections made on the bare `/ws/bot` route.
    pub default_namespace: String,
    /// Outbound queue depth per connection.
    pub max_send_queue: usize,
    /// Upper bound on a single background send to one connection.
    pub send_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// A connection that sends nothing (pongs included) for this long is closed.
    pub client_timeout_secs: u64,
    pub db_path: PathBuf,
    pub session: SessionSettings,
    pub broadcast: BroadcastSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub expiry_secs: u64,
    pub sweep_interval_secs: u64,
    /// Tell the connection that served a group member when their session lapses.
    pub notify_on_expiry: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastSettings {
    pub tick_interval_ms: u64,
    /// Pending broadcast jobs accepted before `enqueue` reports the queue full.
    pub max_pending: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-target level overrides, e.g. `{"tower_http": "debug"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9091,
            default_namespace: DEFAULT_NAMESPACE.into(),
            max_send_queue: 256,
            send_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            db_path: xhbot_dir().join("database").join("xhbot.db"),
            session: SessionSettings::default(),
            broadcast: BroadcastSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            expiry_secs: 1_800,
            sweep_interval_secs: 60,
            notify_on_expiry: true,
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_pending: 1_024,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

impl ServerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session.sweep_interval_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast.tick_interval_ms)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("max_send_queue", self.max_send_queue as u64),
            ("send_timeout_ms", self.send_timeout_ms),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("client_timeout_secs", self.client_timeout_secs),
            ("session.expiry_secs", self.session.expiry_secs),
            ("session.sweep_interval_secs", self.session.sweep_interval_secs),
            ("broadcast.tick_interval_ms", self.broadcast.tick_interval_ms),
            ("broadcast.max_pending", self.broadcast.max_pending as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::InvalidValue(format!("{name} must be greater than zero")));
        }
        if self.client_timeout_secs <= self.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "client_timeout_secs must exceed heartbeat_interval_secs".into(),
            ));
        }
        if !is_valid_namespace(&self.default_namespace) {
            return Err(SettingsError::InvalidValue(format!(
                "default_namespace {:?} is not a valid namespace",
                self.default_namespace
            )));
        }
        Ok(())
    }
}

/// `~/.xhbot`, falling back to `/tmp/.xhbot` without a home directory.
pub fn xhbot_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".xhbot")
}

pub fn settings_path() -> PathBuf {
    xhbot_dir().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<ServerSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<ServerSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

fn load_with_env(path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<ServerSettings> {
    let defaults = serde_json::to_value(ServerSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: ServerSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, env);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `XHBOT_*` overrides. Unparseable or out-of-range values are logged
/// and ignored.
pub fn apply_env_overrides(settings: &mut ServerSettings, env: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| env(name).filter(|v| !v.is_empty());

    if let Some(v) = read("XHBOT_HOST") {
        settings.host = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_PORT", |v| parse_range(v, 1u16, u16::MAX)) {
        settings.port = v;
    }
    if let Some(v) = read("XHBOT_DEFAULT_NAMESPACE") {
        settings.default_namespace = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_SEND_TIMEOUT_MS", |v| parse_range(v, 1u64, 600_000)) {
        settings.send_timeout_ms = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_SESSION_EXPIRY_SECS", |v| {
        parse_range(v, 1u64, 30 * 24 * 3600)
    }) {
        settings.session.expiry_secs = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_SWEEP_INTERVAL_SECS", |v| parse_range(v, 1u64, 86_400)) {
        settings.session.sweep_interval_secs = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_NOTIFY_ON_EXPIRY", parse_bool) {
        settings.session.notify_on_expiry = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_BROADCAST_TICK_MS", |v| parse_range(v, 10u64, 3_600_000)) {
        settings.broadcast.tick_interval_ms = v;
    }
    if let Some(v) = read("XHBOT_DB_PATH") {
        settings.db_path = PathBuf::from(v);
    }
    if let Some(v) = read("XHBOT_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_parsed(&read, "XHBOT_LOG_JSON", parse_bool) {
        settings.logging.json = v;
    }
}

fn read_parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let val = read(name)?;
    let result = parse(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid env var, ignoring");
    }
    result
}

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a number and keep it only if it lies within `min..=max`.
pub fn parse_range<T: std::str::FromStr + PartialOrd>(val: &str, min: T, max: T) -> Option<T> {
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = ServerSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.port, 9091);
        assert_eq!(settings.default_namespace, "default");
        assert_eq!(settings.session.expiry_secs, 1_800);
        assert!(settings.session.notify_on_expiry);
        assert_eq!(settings.send_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"session": {"expiry_secs": 1800, "sweep_interval_secs": 60}});
        let source = serde_json::json!({"session": {"expiry_secs": 600}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["session"]["expiry_secs"], 600);
        assert_eq!(merged["session"]["sweep_interval_secs"], 60);
    }

    #[test]
    fn merge_skips_nulls_and_replaces_arrays() {
        let target = serde_json::json!({"a": 1, "list": [1, 2, 3]});
        let source = serde_json::json!({"a": null, "list": [9]});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["list"], serde_json::json!([9]));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_with_env(&dir.path().join("absent.json"), env_of(&[])).unwrap();
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"port": 7000, "session": {"expiry_secs": 120},
                "logging": {"json": true, "modules": {"tower_http": "debug"}}}"#,
        )
        .unwrap();

        let settings = load_with_env(&path, env_of(&[])).unwrap();
        assert_eq!(settings.port, 7000);
        assert_eq!(settings.session.expiry_secs, 120);
        assert_eq!(settings.session.sweep_interval_secs, 60);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.modules["tower_http"], "debug");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_with_env(&path, env_of(&[])), Err(SettingsError::Json(_))));
    }

    #[test]
    fn env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"port": 7000}"#).unwrap();

        let settings = load_with_env(
            &path,
            env_of(&[
                ("XHBOT_PORT", "7100"),
                ("XHBOT_SESSION_EXPIRY_SECS", "300"),
                ("XHBOT_NOTIFY_ON_EXPIRY", "off"),
                ("XHBOT_DB_PATH", "/var/lib/xhbot/tokens.db"),
            ]),
        )
        .unwrap();
        assert_eq!(settings.port, 7100);
        assert_eq!(settings.session.expiry_secs, 300);
        assert!(!settings.session.notify_on_expiry);
        assert_eq!(settings.db_path, PathBuf::from("/var/lib/xhbot/tokens.db"));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = ServerSettings::default();
        apply_env_overrides(
            &mut settings,
            env_of(&[
                ("XHBOT_PORT", "0"),
                ("XHBOT_SEND_TIMEOUT_MS", "soon"),
                ("XHBOT_LOG_JSON", "maybe"),
                ("XHBOT_HOST", ""),
            ]),
        );
        assert_eq!(settings, ServerSettings::default());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut settings = ServerSettings::default();
        settings.session.sweep_interval_secs = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("session.sweep_interval_secs"), "got: {err}");
    }

    #[test]
    fn client_timeout_must_exceed_heartbeat() {
        let settings = ServerSettings {
            heartbeat_interval_secs: 30,
            client_timeout_secs: 30,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn bad_default_namespace_rejected() {
        let settings = ServerSettings {
            default_namespace: "no spaces".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("nah"), None);
        assert_eq!(parse_range("42", 1u64, 100), Some(42));
        assert_eq!(parse_range("420", 1u64, 100), None);
        assert_eq!(parse_range::<u16>("-1", 1, 10), None);
    }
}
