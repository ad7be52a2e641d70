//! Node configuration.
//!
//! Values are layered: built-in defaults, then a TOML file, then `HYPHA_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use hypha_crypto::NodeIdentity;
use hypha_transport::{CONTEXT_HEADER_LEN, DEFAULT_MAX_CONTEXT_LEN};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Topic every node joins unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "hypha.neural.v1";

/// Environment variable naming a TOML config file.
pub const CONFIG_PATH_ENV: &str = "HYPHA_CONFIG";

/// Node configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Topic name; the discovery key is its SHA-256.
    pub topic: String,
    /// 64-character hex master seed.
    pub seed_hex: Option<String>,
    /// Passphrase hashed into a master seed.
    pub seed_phrase: Option<String>,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Consecutive silent heartbeat intervals tolerated before closing.
    pub max_missed_heartbeats: u32,
    pub max_context_bytes: usize,
    /// Per-connection cap on bytes queued for writing.
    pub write_queue_limit_bytes: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            seed_hex: None,
            seed_phrase: None,
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 5_000,
            max_missed_heartbeats: 3,
            max_context_bytes: DEFAULT_MAX_CONTEXT_LEN,
            write_queue_limit_bytes: 2 * DEFAULT_MAX_CONTEXT_LEN,
        }
    }
}

impl NodeConfig {
    /// Defaults, then the file named by `HYPHA_CONFIG` (if set), then the
    /// process environment. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::load_from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. Missing keys take their defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from `HYPHA_*` variables, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(topic) = lookup("HYPHA_TOPIC") {
            self.topic = topic;
        }
        if let Some(seed) = lookup("HYPHA_SEED") {
            self.seed_hex = Some(seed);
        }
        if let Some(phrase) = lookup("HYPHA_SEED_PHRASE") {
            self.seed_phrase = Some(phrase);
        }
        parse_env(&lookup, "HYPHA_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms)?;
        parse_env(&lookup, "HYPHA_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms)?;
        parse_env(&lookup, "HYPHA_MAX_MISSED_HEARTBEATS", &mut self.max_missed_heartbeats)?;
        parse_env(&lookup, "HYPHA_MAX_CONTEXT_BYTES", &mut self.max_context_bytes)?;
        parse_env(&lookup, "HYPHA_WRITE_QUEUE_LIMIT_BYTES", &mut self.write_queue_limit_bytes)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.is_empty() {
            return Err(ConfigError::Invalid("topic must not be empty".to_string()));
        }
        if self.seed_hex.is_some() && self.seed_phrase.is_some() {
            return Err(ConfigError::Invalid(
                "seed_hex and seed_phrase are mutually exclusive".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("handshake_timeout_ms must be > 0".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".to_string()));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(ConfigError::Invalid("max_missed_heartbeats must be > 0".to_string()));
        }
        if self.max_context_bytes == 0 || self.max_context_bytes > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_context_bytes must be between 1 and {}",
                u32::MAX
            )));
        }
        let largest_frame = CONTEXT_HEADER_LEN + self.max_context_bytes;
        if self.write_queue_limit_bytes < largest_frame {
            return Err(ConfigError::Invalid(format!(
                "write_queue_limit_bytes must hold at least one maximal frame ({largest_frame} bytes)"
            )));
        }
        if let Some(seed) = &self.seed_hex {
            NodeIdentity::from_hex(seed)?;
        }
        Ok(())
    }

    /// Derive the node identity from whichever seed form is configured, or a
    /// fresh random one if neither is.
    pub fn identity(&self) -> Result<NodeIdentity, ConfigError> {
        match (&self.seed_hex, &self.seed_phrase) {
            (Some(_), Some(_)) => Err(ConfigError::Invalid(
                "seed_hex and seed_phrase are mutually exclusive".to_string(),
            )),
            (Some(seed), None) => Ok(NodeIdentity::from_hex(seed)?),
            (None, Some(phrase)) => Ok(NodeIdentity::from_phrase(phrase)),
            (None, None) => Ok(NodeIdentity::generate()?),
        }
    }

    /// Per-connection settings.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            max_missed_heartbeats: self.max_missed_heartbeats,
            max_context_bytes: self.max_context_bytes,
            write_queue_limit_bytes: self.write_queue_limit_bytes,
        }
    }
}

fn parse_env<F, T>(lookup: &F, key: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { key, value })?;
    }
    Ok(())
}

/// Settings applied to every connection of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub max_context_bytes: usize,
    pub write_queue_limit_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        NodeConfig::default().connection()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.topic, "hypha.neural.v1");
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.heartbeat_interval_ms, 5000);
        assert_eq!(config.max_missed_heartbeats, 3);
        assert_eq!(config.max_context_bytes, 16 * 1024 * 1024);
        assert_eq!(config.write_queue_limit_bytes, 32 * 1024 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NodeConfig::from_toml_str(
            r#"
            seed_phrase = "A"
            heartbeat_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.seed_phrase.as_deref(), Some("A"));
        assert_eq!(config.heartbeat_interval_ms, 250);
        assert_eq!(config.handshake_timeout_ms, 5000);
        assert_eq!(config.topic, DEFAULT_TOPIC);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "topic = \"hypha.test\"\nmax_missed_heartbeats = 5").unwrap();
        let config = NodeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.topic, "hypha.test");
        assert_eq!(config.max_missed_heartbeats, 5);

        assert!(matches!(
            NodeConfig::load_from_file("/nonexistent/hypha.toml"),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = NodeConfig::from_toml_str("heartbeat_interval_ms = 250").unwrap();
        config
            .apply_env(env(&[
                ("HYPHA_HEARTBEAT_INTERVAL_MS", "100"),
                ("HYPHA_TOPIC", "other"),
                ("HYPHA_SEED_PHRASE", "B"),
            ]))
            .unwrap();
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert_eq!(config.topic, "other");
        assert_eq!(config.seed_phrase.as_deref(), Some("B"));
    }

    #[test]
    fn test_env_parse_error_names_key() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_env(env(&[("HYPHA_MAX_MISSED_HEARTBEATS", "many")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidEnv { key, value } => {
                assert_eq!(key, "HYPHA_MAX_MISSED_HEARTBEATS");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            NodeConfig { handshake_timeout_ms: 0, ..Default::default() },
            NodeConfig { heartbeat_interval_ms: 0, ..Default::default() },
            NodeConfig { max_missed_heartbeats: 0, ..Default::default() },
            NodeConfig { max_context_bytes: 0, ..Default::default() },
            NodeConfig { write_queue_limit_bytes: 1024, ..Default::default() },
            NodeConfig { topic: String::new(), ..Default::default() },
            NodeConfig { seed_hex: Some("zz".into()), ..Default::default() },
            NodeConfig {
                seed_hex: Some("00".repeat(32)),
                seed_phrase: Some("A".into()),
                ..Default::default()
            },
        ];
        for config in bad {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_identity_from_seed_forms() {
        let phrase = NodeConfig { seed_phrase: Some("A".into()), ..Default::default() };
        assert_eq!(
            phrase.identity().unwrap().node_id(),
            NodeIdentity::from_phrase("A").node_id()
        );

        let seed = "11".repeat(32);
        let hex = NodeConfig { seed_hex: Some(seed.clone()), ..Default::default() };
        assert_eq!(
            hex.identity().unwrap().node_id(),
            NodeIdentity::from_hex(&seed).unwrap().node_id()
        );

        let random = NodeConfig::default();
        assert_ne!(
            random.identity().unwrap().node_id(),
            random.identity().unwrap().node_id()
        );
    }

    #[test]
    fn test_connection_config() {
        let config = NodeConfig { heartbeat_interval_ms: 250, ..Default::default() };
        let conn = config.connection();
        assert_eq!(conn.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(conn.handshake_timeout, Duration::from_secs(5));
        assert_eq!(conn.max_missed_heartbeats, 3);
    }
}
