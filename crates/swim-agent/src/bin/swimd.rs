//! Main binary for the swimmesh membership daemon (swimd)

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use swim_agent::{init_logging, run, NodeOverrides};
use swim_core::Config;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "swimd")]
#[command(about = "SWIM cluster membership daemon for swimmesh")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the cluster and run until interrupted
    Start {
        /// Local member name (host:port)
        #[arg(long)]
        name: Option<String>,

        /// Seed member, may be repeated
        #[arg(long = "peer", value_name = "HOST:PORT")]
        peers: Vec<String>,

        /// Metadata pair advertised for this member, may be repeated
        #[arg(long = "metadata", value_name = "KEY=VALUE")]
        metadata: Vec<String>,

        /// Shared cluster secret
        #[arg(long, env = "SWIM_NODE__SECRET", hide_env_values = true)]
        secret: Option<String>,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Start {
            ref name,
            ref peers,
            ref metadata,
            ref secret,
        }) => {
            let overrides = NodeOverrides {
                name: name.clone(),
                peers: peers.clone(),
                metadata: metadata.clone(),
                secret: secret.clone(),
            };
            start_node(&cli, overrides).await
        }
        Some(Commands::Config { output }) => generate_config(output),
        Some(Commands::Validate { config }) => validate_config(config),
        None => start_node(&cli, NodeOverrides::default()).await,
    }
}

async fn start_node(cli: &Cli, overrides: NodeOverrides) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.logging.format = format.clone();
    }
    overrides.apply(&mut config)?;

    config.validate().context("Invalid configuration")?;
    init_logging(&config.logging)?;

    info!("Starting swimd as {}", config.node.name);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl-C");
    };

    run(&config, shutdown).await?;
    info!("swimd stopped");
    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        let yaml = serde_yaml::to_string(&config).context("Failed to serialize config")?;
        println!("{}", yaml);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> anyhow::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = Config::from_file(&config_path)?;
    config.validate()?;

    println!("Configuration is valid");
    println!("Member name: {}", config.node.name);
    println!("Bind address: {}", config.node.bind_addr());
    println!("Seed peers:");
    for peer in &config.node.peers {
        println!("  - {}", peer);
    }
    println!(
        "Probe interval: {}ms, suspect timeout: {}ms",
        config.protocol.ping_interval_ms, config.protocol.suspect_timeout_ms
    );

    Ok(())
}
