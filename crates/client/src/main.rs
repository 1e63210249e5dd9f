//! Reference launchpad client binary.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

use std::sync::Arc;

use clap::{ArgAction, Parser};
use launchpad_client::{Error, methods, retry_policy};
use launchpad_rpc::{Connector, DriverExit, ReconnectDriver, Session, find_connector};
use launchpad_transport_ws::WebSocketConnector;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to connect to
    #[arg(long, env = "LAUNCHPAD_CONNECT", value_name = "protocol://address[:port]")]
    connect: Url,

    /// Up to `TRIES` failed attempts, sleep `SECONDS` before reconnecting
    #[arg(
        long,
        num_args = 2,
        value_names = ["TRIES", "SECONDS"],
        action = ArgAction::Append
    )]
    reconnect: Vec<u64>,

    /// Sleep once every `--reconnect` step is used up; without it the client
    /// exits instead
    #[arg(long, env = "LAUNCHPAD_RECONNECT_DEFAULT", value_name = "SECONDS")]
    reconnect_default: Option<u64>,

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

    let policy = retry_policy(&args.reconnect, args.reconnect_default)?;

    let connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(WebSocketConnector::new())];
    let connector = find_connector(&connectors, &args.connect)
        .cloned()
        .ok_or_else(|| Error::NoTransport(args.connect.scheme().to_string()))?;

    let session = Session::new(methods());
    let driver = ReconnectDriver::new(args.connect, connector, session).with_policy(policy);

    // Create shared shutdown token
    let shutdown_token = CancellationToken::new();

    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => {
                info!("Shutting down");
                signal_shutdown_token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signals: {}", e),
        }
    });

    match driver.run(shutdown_token).await {
        DriverExit::PolicyExhausted => info!("Reconnect policy exhausted, exiting"),
        DriverExit::Shutdown => info!("Shut down"),
    }

    Ok(())
}
