//! Configuration management for swimmesh
//!
//! Provides a layered configuration system: built-in defaults, an optional
//! YAML file, and `SWIM_`-prefixed environment variables (nested keys are
//! separated by `__`, e.g. `SWIM_NODE__SECRET`).

use crate::{Error, MemberName, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "SWIM_CONFIG";

/// Main configuration structure for a swimmesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Local node identity, peers and secret
    pub node: NodeConfig,

    /// Protocol tunables
    pub protocol: ProtocolConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file (`path`, or the file named by `SWIM_CONFIG`)
    /// 3. Defaults (lowest)
    ///
    /// The result is not validated; callers apply their own overrides first
    /// and then call [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path));
            }
            None => {
                if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
                    builder = builder
                        .add_source(config::File::with_name(&config_path).required(false));
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SWIM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("node.peers"),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Load configuration from a YAML file without consulting the environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.protocol.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Node-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Local member name, `host:port`
    pub name: MemberName,

    /// Bind address override; the local name is bound when unset
    pub bind: Option<String>,

    /// Seed members contacted at startup
    pub peers: Vec<MemberName>,

    /// Opaque metadata advertised for the local member
    pub metadata: BTreeMap<String, String>,

    /// Shared cluster secret used to sign every packet
    pub secret: Option<String>,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.as_str().is_empty() {
            return Err(Error::config("Local member name cannot be empty"));
        }

        match self.secret.as_deref() {
            None => Err(Error::secret_unavailable(
                "node.secret must be set (or SWIM_NODE__SECRET)",
            )),
            Some(secret) if secret.is_empty() => {
                Err(Error::secret_unavailable("node.secret cannot be empty"))
            }
            Some(_) => Ok(()),
        }
    }

    /// The address to bind, falling back to the local name
    pub fn bind_addr(&self) -> &str {
        self.bind.as_deref().unwrap_or_else(|| self.name.as_str())
    }

    /// Encode the metadata map as opaque bytes (`key=value` lines, key order)
    pub fn metadata_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (key, value) in &self.metadata {
            if !out.is_empty() {
                out.push(b'\n');
            }
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        out
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: MemberName::new("127.0.0.1:7946"),
            bind: None,
            peers: Vec::new(),
            metadata: BTreeMap::new(),
            secret: None,
        }
    }
}

/// Tunables of the failure detection and dissemination loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Interval between failure detection probes in milliseconds
    pub ping_interval_ms: u64,

    /// Time to wait for a direct ack in milliseconds
    pub ping_timeout_ms: u64,

    /// Number of relays asked to probe on our behalf
    pub ping_req_count: usize,

    /// Time to wait for a relayed ack in milliseconds
    pub ping_req_timeout_ms: u64,

    /// Time a member stays suspect before it is declared unavailable
    pub suspect_timeout_ms: u64,

    /// Time a member stays unavailable before it is declared offline
    pub unavailable_timeout_ms: u64,

    /// Time an offline member is retained before it is pruned
    pub offline_retention_ms: u64,

    /// Interval between dissemination rounds in milliseconds
    pub sync_interval_ms: u64,

    /// Number of peers receiving gossip each dissemination round
    pub gossip_fanout: usize,

    /// Maximum gossip entries per packet
    pub max_gossip_entries: usize,

    /// Maximum size of a signed datagram in bytes
    pub max_packet_size: usize,
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("ping_interval_ms", self.ping_interval_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
            ("ping_req_timeout_ms", self.ping_req_timeout_ms),
            ("suspect_timeout_ms", self.suspect_timeout_ms),
            ("unavailable_timeout_ms", self.unavailable_timeout_ms),
            ("offline_retention_ms", self.offline_retention_ms),
            ("sync_interval_ms", self.sync_interval_ms),
        ];
        for (name, value) in durations {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", name)));
            }
        }

        if self.ping_req_timeout_ms < self.ping_timeout_ms {
            return Err(Error::config(
                "ping_req_timeout_ms cannot be shorter than ping_timeout_ms",
            ));
        }

        if self.gossip_fanout == 0 {
            return Err(Error::config("gossip_fanout must be greater than zero"));
        }

        if self.max_gossip_entries == 0 {
            return Err(Error::config("max_gossip_entries must be greater than zero"));
        }

        if self.max_packet_size < 256 {
            return Err(Error::config("max_packet_size must be at least 256 bytes"));
        }

        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ping_req_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_req_timeout_ms)
    }

    pub fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.suspect_timeout_ms)
    }

    pub fn unavailable_timeout(&self) -> Duration {
        Duration::from_millis(self.unavailable_timeout_ms)
    }

    pub fn offline_retention(&self) -> Duration {
        Duration::from_millis(self.offline_retention_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 1000,
            ping_timeout_ms: 300,
            ping_req_count: 3,
            ping_req_timeout_ms: 900,
            suspect_timeout_ms: 5000,
            unavailable_timeout_ms: 30_000,
            offline_retention_ms: 300_000,
            sync_interval_ms: 300,
            gossip_fanout: 2,
            max_gossip_entries: 16,
            max_packet_size: 1400, // Safe UDP packet size
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Show target in logs
    pub show_target: bool,

    /// Log file path (optional)
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        match self.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(Error::config(format!("Invalid log level: {}", self.level))),
        }

        match self.format.as_str() {
            "text" | "json" => Ok(()),
            _ => Err(Error::config(format!("Invalid log format: {}", self.format))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            file: None,
        }
    }
}
