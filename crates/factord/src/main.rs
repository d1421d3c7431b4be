//! factord — the FactorGrid daemon.
//!
//! Single binary that assembles the dispatcher control plane:
//! - Instance provider + fleet manager
//! - Dispatcher (admission, ledger, failure re-dispatch)
//! - Health monitor
//! - Telemetry feed
//! - Autoscaler
//! - HTTP surface (`/f.html`, `/r.html`, `/api/v1`)
//!
//! # Usage
//!
//! ```text
//! factord run --config /etc/factord.toml
//! factord config --config /etc/factord.toml   # print effective config
//! ```
//!
//! Type `exit` on stdin, or press Ctrl-C, to shut down.

mod control;
mod daemon;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use factor_core::FactorConfig;

#[derive(Parser)]
#[command(name = "factord", about = "FactorGrid dispatcher daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher.
    Run {
        /// Path to factord.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Override `server.public_ip`.
        #[arg(long)]
        public_ip: Option<String>,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,factord=debug,factorgrid=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            public_ip,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(ip) = public_ip {
                config.server.public_ip = ip;
            }
            config.validate()?;
            daemon::run(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FactorConfig> {
    match path {
        Some(path) => FactorConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("load {}: {e}", path.display())),
        None => Ok(FactorConfig::default()),
    }
}
