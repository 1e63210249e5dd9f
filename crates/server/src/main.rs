//! Reference launchpad server binary.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use launchpad_server::{Error, LaunchpadServer, ServerConfig};
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080", env = "LAUNCHPAD_LISTEN")]
    listen: SocketAddr,

    /// Default timeout of API calls, in seconds
    #[arg(long, default_value_t = 30, env = "LAUNCHPAD_CALL_TIMEOUT")]
    call_timeout: u64,

    /// Log more (repeat for more detail)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received interrupt signal");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let server = LaunchpadServer::new(ServerConfig {
        listen_addr: args.listen,
        call_timeout: Duration::from_secs(args.call_timeout),
        ..ServerConfig::default()
    });
    let addr = server.start().await?;
    info!("Clients connect to ws://{}/transport/ws/<client_id>", addr);

    if let Err(e) = wait_for_signal().await {
        error!("Failed to listen for shutdown signals: {}", e);
    }

    server.shutdown().await;
    Ok(())
}
