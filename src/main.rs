//! `daq-relay` command line: run a document proxy or tail a relay.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_relay::config::RelayConfig;
use daq_relay::distribution::{Proxy, RemoteDispatcher, Subscription};
use daq_relay::logging;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "daq-relay", version, about = "Relay run documents between processes")]
struct Cli {
    /// Configuration file (defaults to ./daq-relay.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Forward records from publishers to every connected subscriber
    Proxy {
        /// Collection port publishers connect to
        #[arg(long)]
        in_port: Option<u16>,
        /// Broadcast port remote dispatchers connect to
        #[arg(long)]
        out_port: Option<u16>,
    },
    /// Print documents arriving from a proxy as JSON lines
    Tail {
        /// Proxy broadcast endpoint, host:port
        address: Option<String>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        engine_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RelayConfig::load_from(path),
        None => RelayConfig::load(),
    }
    .context("failed to load configuration")?;
    logging::init(&config.logging);

    match cli.command {
        Command::Proxy { in_port, out_port } => {
            config.proxy.in_port = in_port.or(config.proxy.in_port);
            config.proxy.out_port = out_port.or(config.proxy.out_port);
            run_proxy(&config).await
        }
        Command::Tail {
            address,
            hostname,
            pid,
            engine_id,
        } => {
            let remote = &mut config.remote;
            remote.address = address.or(remote.address.take());
            remote.hostname = hostname.or(remote.hostname.take());
            remote.pid = pid.or(remote.pid);
            remote.engine_id = engine_id.or(remote.engine_id.take());
            run_tail(&config).await
        }
    }
}

async fn run_proxy(config: &RelayConfig) -> Result<()> {
    let mut proxy = Proxy::from_config(&config.proxy).await?;
    println!("{proxy}");

    let stop = proxy.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping proxy");
            stop.stop();
        }
    });

    proxy.start().await?;
    Ok(())
}

async fn run_tail(config: &RelayConfig) -> Result<()> {
    let mut remote = RemoteDispatcher::from_config(&config.remote)
        .context("tail needs a proxy address (argument or remote.address)")?;
    remote.subscribe(Subscription::All, |kind, doc| {
        let body = serde_json::to_string(doc)?;
        println!("{kind} {body}");
        Ok(())
    });
    remote.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    remote.stop();
    Ok(())
}
