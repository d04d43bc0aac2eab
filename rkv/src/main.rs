mod applier;
mod command;
mod config;
mod metrics;
mod resp;
mod server;
mod snapshot;
mod state_machine;
mod store;

use std::io::{self, BufWriter};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;

use crate::server::{Server, Termination};
use crate::store::FileStore;

#[derive(Parser, Debug)]
#[command(name = "rkv", about = "Replicated key-value node speaking RESP")]
struct Args {
    /// Runtime config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the node (the default)
    Serve {
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        data_dir: Option<String>,
        /// Snapshot to load before accepting clients
        #[arg(long)]
        restore_from: Option<String>,
    },
    /// Print the SET commands that rebuild the exported keys of a snapshot
    Export {
        #[arg(long)]
        snapshot: PathBuf,
    },
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn export(snapshot: PathBuf) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let written = snapshot::write_commands_from_snapshot(BufWriter::new(stdout.lock()), &snapshot)?;
    log::info!("exported {} keys from {}", written, snapshot.display());
    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let (mut server, mut termination) = Server::<FileStore>::builder(config::instance().clone())?;
    let addr = server.start().await?;
    log::info!("rkv node serving on {}", addr);

    let outcome = tokio::select! {
        _ = shutdown_signal() => None,
        reason = termination.recv() => reason,
    };
    server.stop();

    match outcome {
        Some(Termination::Fatal(reason)) => {
            log::error!("terminating: {}", reason);
            std::process::exit(1);
        }
        Some(Termination::Shutdown) => log::info!("shutdown requested by client"),
        None => log::info!("shutdown signal received"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();

    match args.command {
        Some(Cmd::Export { snapshot }) => export(snapshot),
        command => {
            let mut config = config::RuntimeConfig::from_toml(&args.config);
            if let Some(Cmd::Serve {
                addr,
                data_dir,
                restore_from,
            }) = command
            {
                config.addr = addr.unwrap_or(config.addr);
                config.data_dir = data_dir.unwrap_or(config.data_dir);
                config.restore_from = restore_from.or(config.restore_from);
            }
            config::init(config);
            serve().await
        }
    }
}
