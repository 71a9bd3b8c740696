//! Pubsock server binary
//!
//! Run with: cargo run -- serve --port 8080
//!
//! # Configuration
//!
//! Loaded from `--config PATH` or the first of
//! `~/.config/pubsock/config.toml`, `/etc/pubsock/config.toml` and
//! `./pubsock.toml`, then overridden by `PUBSOCK_*` environment variables and
//! finally by command-line flags. `RUST_LOG` overrides the configured level.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pubsock::config::{generate_default_config, Config, ConfigSource, LoggingConfig};
use pubsock::server::WebSocketServer;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pubsock")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket pub/sub server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Config file (default: standard locations)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Maximum concurrent connections
        #[arg(long)]
        max_clients: Option<usize>,
        /// Seconds of silence before a keepalive ping
        #[arg(long)]
        ping_interval: Option<u64>,
    },

    /// Print or write the default configuration
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            host,
            port,
            config,
            max_clients,
            ping_interval,
        } => {
            let (mut config, source) = match config {
                Some(path) => {
                    let config = Config::load_with_env(&path)
                        .with_context(|| format!("Failed to load config from {:?}", path))?;
                    (config, ConfigSource::File(path))
                }
                None => Config::discover(),
            };
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(max_clients) = max_clients {
                config.server.max_clients = max_clients;
            }
            if let Some(secs) = ping_interval {
                config.server.ping_interval_secs = secs;
            }
            config.validate()?;

            init_tracing(&config.logging);
            source.log();
            serve(config).await
        }
        Commands::Config { output } => {
            let template = generate_default_config();
            match output {
                Some(path) => {
                    std::fs::write(&path, template)
                        .with_context(|| format!("Failed to write {:?}", path))?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => print!("{}", template),
            }
            Ok(())
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("pubsock={}", logging.level).into());

    let (json, pretty) = if logging.format == "json" {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .init();
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting pubsock v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Max clients: {}, ping interval: {}s, TLS: {}",
        config.server.max_clients,
        config.server.ping_interval_secs,
        config.tls.enabled
    );

    let server = WebSocketServer::new(config);
    let handle = server.handle();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            handle.stop();
        }
    });

    server.start().await?;
    tracing::info!("Pubsock shutdown complete");
    Ok(())
}
