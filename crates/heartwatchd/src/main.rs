//! heartwatchd, the Heartwatch daemon.
//!
//! Single binary that assembles the Heartwatch subsystems:
//! - State store (redb)
//! - Shared cache and delayed queue (in-process)
//! - Heartbeat tracker, transition consumer and stats emitter
//! - Report throttle
//! - REST API
//!
//! # Usage
//!
//! ```text
//! heartwatchd standalone --config /etc/heartwatch/heartwatch.toml --data-dir /var/lib/heartwatch
//! heartwatchd config --config /etc/heartwatch/heartwatch.toml
//! ```

mod standalone;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use heartwatch_core::HeartwatchConfig;

#[derive(Parser)]
#[command(name = "heartwatchd", about = "Heartwatch daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single Heartwatch instance.
    Standalone {
        /// Path to heartwatch.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state (overrides the config file).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Address to listen on (overrides the config file).
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Print the effective configuration and exit.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,heartwatchd=debug,heartwatch_tracker=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HeartwatchConfig> {
    match path {
        Some(path) => HeartwatchConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(HeartwatchConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Standalone {
            config,
            data_dir,
            listen,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            if let Some(listen) = listen {
                config.server.listen = listen.to_string();
            }
            config.validate()?;
            standalone::run(config).await
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            config.validate()?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
