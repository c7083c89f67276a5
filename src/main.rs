//! Switchboard - A Persistent-Connection Command Server
//!
//! This is the main entry point for the Switchboard server.
//! It loads configuration, sets up logging, binds the listener and runs
//! until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use switchboard::commands::Direction;
use switchboard::config::ServerConfig;
use switchboard::server::Server;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line interface for the Switchboard server.
#[derive(Parser, Debug)]
#[command(name = "switchboard", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Host to bind to (overrides the configuration file).
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides the configuration file).
    #[arg(short, long)]
    port: Option<u16>,
}

impl Cli {
    /// Loads the configuration file, if any, and applies flag overrides.
    fn load_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

/// `RUST_LOG` wins; otherwise the configured level applies.
fn init_tracing(config: &ServerConfig) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new(&config.log_level),
    };

    fmt::Subscriber::builder()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(env_filter)
        .init();
}

fn print_banner(config: &ServerConfig) {
    println!(
        r#"
Switchboard v{} - Persistent-Connection Command Server
──────────────────────────────────────────────────────────────
Server started on {}
Journal: {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        switchboard::VERSION,
        config.bind_address(),
        config.journal.path.display()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    init_tracing(&config);

    let server = Server::bind(config.clone())
        .await
        .context("starting server")?
        .on_ready(move |state| {
            info!(
                inbound = state.registry.len(Direction::Inbound),
                outbound = state.registry.len(Direction::Outbound),
                "Command registry ready"
            );
            print_banner(&config);
        });

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C, shutting down");
        }
    };

    let report = server.run(shutdown).await;
    match serde_json::to_string(&report) {
        Ok(json) => info!(report = %json, "Final statistics"),
        Err(e) => error!(error = %e, "Failed to encode final statistics"),
    }

    Ok(())
}
