//! plaza-gateway - run a Plaza gateway for one space.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use plaza_core::config::SpaceConfig;
use plaza_gateway::{GatewayConfig, GatewayRuntime};

#[derive(Debug, Parser)]
#[command(name = "plaza-gateway", about = "Multi-participant coordination gateway")]
struct Args {
    /// Path to the space configuration file (JSON).
    #[arg(long)]
    space: PathBuf,

    /// TCP listen address, e.g. 127.0.0.1:7600.
    #[arg(long)]
    tcp: Option<SocketAddr>,

    /// Unix domain socket path.
    #[arg(long)]
    uds: Option<PathBuf>,

    /// Correlation timeout in seconds.
    #[arg(long, default_value_t = 30)]
    correlation_timeout: u64,

    /// Consecutive malformed frames tolerated before disconnecting a peer.
    #[arg(long, default_value_t = 10)]
    malformed_threshold: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.tcp.is_none() && args.uds.is_none() {
        eprintln!("error: at least one of --tcp or --uds is required");
        return ExitCode::FAILURE;
    }

    let space = match SpaceConfig::load(&args.space) {
        Ok(space) => space,
        Err(err) => {
            eprintln!("error: failed to load space config: {err}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = GatewayConfig::new(space);
    config.listen_tcp = args.tcp;
    config.listen_uds = args.uds;
    config.correlation_timeout = Duration::from_secs(args.correlation_timeout);
    config.malformed_rate_threshold = args.malformed_threshold;

    let mut runtime = GatewayRuntime::new(config).await;
    if let Err(err) = runtime.start().await {
        eprintln!("error: failed to start gateway: {err}");
        return ExitCode::FAILURE;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutting down"),
        Err(err) => tracing::error!(%err, "signal handler failed"),
    }
    runtime.shutdown();
    ExitCode::SUCCESS
}
