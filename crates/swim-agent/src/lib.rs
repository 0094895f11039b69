//! # swim-agent
//!
//! Runtime glue for the `swimd` daemon: logging setup, command-line overrides
//! on top of the layered configuration, and the membership change log printed
//! while a node runs.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::future::Future;
use std::sync::Mutex;
use swim_core::{Config, LoggingConfig, MemberName};
use swim_gossip::{GossipError, GossipNode, MemberChange, Status};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Agent-specific error types
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] swim_core::Error),

    #[error("Gossip error: {0}")]
    Gossip(#[from] GossipError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Output goes to
/// stderr unless a log file is configured.
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let writer = match &logging_config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_ansi(logging_config.file.is_none())
        .with_writer(writer);

    let installed = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };
    installed.map_err(|e| AgentError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Node settings given on the command line
#[derive(Debug, Clone, Default)]
pub struct NodeOverrides {
    pub name: Option<String>,
    pub peers: Vec<String>,
    pub metadata: Vec<String>,
    pub secret: Option<String>,
}

impl NodeOverrides {
    /// Apply the overrides on top of `config`.
    ///
    /// Peers given here replace the configured list; metadata pairs are merged
    /// into the configured map.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(name) = &self.name {
            config.node.name = MemberName::new(name.as_str());
        }

        if !self.peers.is_empty() {
            config.node.peers = self.peers.iter().map(|p| MemberName::new(p.as_str())).collect();
        }

        for pair in &self.metadata {
            let (key, value) = parse_metadata(pair)?;
            config.node.metadata.insert(key, value);
        }

        if let Some(secret) = &self.secret {
            config.node.secret = Some(secret.clone());
        }

        Ok(())
    }
}

/// Parse a `key=value` metadata pair
pub fn parse_metadata(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(AgentError::Config(format!(
            "Invalid metadata '{}', expected key=value",
            pair
        ))),
    }
}

#[derive(Debug, Serialize)]
struct ChangeRecord<'a> {
    at: DateTime<Utc>,
    member: &'a MemberName,
    status: Status,
    clock: u64,
    metadata_clock: u64,
    metadata: Option<String>,
}

/// Render one membership change observed at `at` as a log line, JSON or text
pub fn format_change(change: &MemberChange, at: DateTime<Utc>, json: bool) -> Result<String> {
    let metadata = change
        .metadata
        .payload
        .as_deref()
        .map(|payload| String::from_utf8_lossy(payload).replace('\n', ","));

    if json {
        let record = ChangeRecord {
            at,
            member: &change.name,
            status: change.status,
            clock: change.clock,
            metadata_clock: change.metadata.clock,
            metadata,
        };
        return Ok(serde_json::to_string(&record)?);
    }

    let mut line = format!(
        "{} {} is {} (clock {})",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        change.name,
        change.status,
        change.clock
    );
    if let Some(metadata) = metadata {
        line.push_str(&format!(" metadata [{}]", metadata));
    }
    Ok(line)
}

/// Run a node until `shutdown` resolves, printing every membership change.
///
/// The node leaves the cluster gracefully before this returns.
pub async fn run<F>(config: &Config, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    let json = config.logging.format == "json";
    let mut node = GossipNode::bind(config).await?;
    let mut changes = node.subscribe();

    info!("swimd running as {}", node.name());

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            change = changes.recv() => match change {
                Ok(change) => println!("{}", format_change(&change, Utc::now(), json)?),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Change log fell behind, skipped {} changes", skipped)
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Leaving cluster");
    node.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swim_gossip::Metadata;

    fn change(payload: Option<&[u8]>) -> MemberChange {
        MemberChange {
            name: MemberName::new("10.0.0.2:7946"),
            status: Status::Suspect,
            clock: 7,
            metadata: Metadata::new(3, payload.map(|p| p.to_vec())),
        }
    }

    #[test]
    fn test_parse_metadata() {
        assert_eq!(
            parse_metadata("zone=eu-west").unwrap(),
            ("zone".to_string(), "eu-west".to_string())
        );
        assert_eq!(
            parse_metadata("url=http://a/?b=c").unwrap(),
            ("url".to_string(), "http://a/?b=c".to_string())
        );
        assert_eq!(parse_metadata("flag=").unwrap().1, "");
        assert!(parse_metadata("novalue").is_err());
        assert!(parse_metadata("=value").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.node.peers = vec![MemberName::new("10.0.0.9:7946")];
        config.node.metadata.insert("zone".to_string(), "a".to_string());

        let overrides = NodeOverrides {
            name: Some("10.0.0.1:7946".to_string()),
            peers: vec!["10.0.0.2:7946".to_string(), "10.0.0.3:7946".to_string()],
            metadata: vec!["zone=b".to_string(), "rack=4".to_string()],
            secret: Some("s3cret".to_string()),
        };
        overrides.apply(&mut config).unwrap();

        assert_eq!(config.node.name, MemberName::new("10.0.0.1:7946"));
        assert_eq!(config.node.peers.len(), 2);
        assert_eq!(config.node.metadata["zone"], "b");
        assert_eq!(config.node.metadata["rack"], "4");
        assert_eq!(config.node.secret.as_deref(), Some("s3cret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_overrides_keep_config() {
        let mut config = Config::default();
        config.node.peers = vec![MemberName::new("10.0.0.9:7946")];
        let before = config.clone();

        NodeOverrides::default().apply(&mut config).unwrap();
        assert_eq!(config, before);

        let bad = NodeOverrides {
            metadata: vec!["broken".to_string()],
            ..Default::default()
        };
        assert!(matches!(bad.apply(&mut config), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_format_change() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.250Z")
            .unwrap()
            .with_timezone(&Utc);

        let text = format_change(&change(Some(b"rack=4\nzone=b")), at, false).unwrap();
        assert_eq!(
            text,
            "2024-05-01T12:00:00.250Z 10.0.0.2:7946 is suspect (clock 7) metadata [rack=4,zone=b]"
        );

        let text = format_change(&change(None), at, false).unwrap();
        assert_eq!(text, "2024-05-01T12:00:00.250Z 10.0.0.2:7946 is suspect (clock 7)");

        let json = format_change(&change(Some(b"rack=4")), at, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["at"].as_str().unwrap().starts_with("2024-05-01T12:00:00"));
        assert_eq!(value["member"], "10.0.0.2:7946");
        assert_eq!(value["clock"], 7);
        assert_eq!(value["metadata_clock"], 3);
        assert_eq!(value["metadata"], "rack=4");
    }

    #[tokio::test]
    async fn test_secret_given_on_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swimd.yaml");

        let mut config = Config::default();
        config.node.name = MemberName::new("127.0.0.1:7946");
        config.to_file(&path).unwrap();

        let mut loaded = Config::load(Some(&path)).unwrap();
        if std::env::var("SWIM_NODE__SECRET").is_err() {
            assert!(matches!(
                loaded.validate(),
                Err(swim_core::Error::SecretUnavailable(_))
            ));
        }

        NodeOverrides {
            name: Some("127.0.0.1:0".to_string()),
            secret: Some("s3cret".to_string()),
            ..Default::default()
        }
        .apply(&mut loaded)
        .unwrap();
        assert!(loaded.validate().is_ok());
        run(&loaded, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let mut config = Config::default();
        config.node.name = MemberName::new("127.0.0.1:0");
        config.node.secret = Some("s3cret".to_string());

        run(&config, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_without_secret_fails() {
        let mut config = Config::default();
        config.node.name = MemberName::new("127.0.0.1:0");

        let err = run(&config, async {}).await.unwrap_err();
        assert!(matches!(err, AgentError::Gossip(_)));
    }
}
