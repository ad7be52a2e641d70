//! Daemon configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use hypha_core::config::CONFIG_PATH_ENV;
use hypha_core::{ConfigError, NodeConfig};
use serde::{Deserialize, Serialize};

/// Everything `hypha-node` needs: the node settings plus where to listen,
/// whom to dial and how often to broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: SocketAddr,
    /// Addresses dialed on start. Only one side of a pair should list the other.
    pub peers: Vec<SocketAddr>,
    /// Seconds between demo broadcasts; 0 disables them.
    pub context_interval_secs: u64,
    #[serde(flatten)]
    pub node: NodeConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4001)),
            peers: Vec::new(),
            context_interval_secs: 5,
            node: NodeConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Defaults, then `path` (or the file named by `HYPHA_CONFIG`), then the
    /// process environment. Not validated; call [`validate`](Self::validate)
    /// once command-line overrides are applied.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Node overrides plus `HYPHA_LISTEN_ADDR`, `HYPHA_PEERS` (comma
    /// separated) and `HYPHA_CONTEXT_INTERVAL_SECS`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.node.apply_env(&lookup)?;
        if let Some(value) = lookup("HYPHA_LISTEN_ADDR") {
            self.listen_addr = parse_value("HYPHA_LISTEN_ADDR", &value)?;
        }
        if let Some(value) = lookup("HYPHA_PEERS") {
            self.peers = value
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(|peer| parse_value("HYPHA_PEERS", peer))
                .collect::<Result<_, _>>()?;
        }
        if let Some(value) = lookup("HYPHA_CONTEXT_INTERVAL_SECS") {
            self.context_interval_secs = parse_value("HYPHA_CONTEXT_INTERVAL_SECS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.validate()?;
        if self.peers.contains(&self.listen_addr) {
            return Err(ConfigError::Invalid(format!(
                "peers must not include our own listen address {}",
                self.listen_addr
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}
