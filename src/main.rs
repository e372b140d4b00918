//! Bouncer fixture binary: binds the listener, registers the three service
//! methods, and serves until killed. The only fatal conditions are a failed
//! bind and an accept-loop failure; both log and exit non-zero.

use bouncer::{service::register_bouncer, RpcConfig, RpcError, RpcServer};
use clap::Parser;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bouncer", about = "RPC conformance fixture with three bounce operations")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:15010")]
    bind: String,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(args).await {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), RpcError> {
    let mut server = RpcServer::new(RpcConfig::new(args.bind));
    register_bouncer(&server).await;

    let listener = server.bind().await?;
    info!("bouncer fixture ready");

    // The sender stays alive for the life of the process; the loop only ends
    // on an accept failure.
    let (_shutdown_tx, shutdown_rx) = oneshot::channel();
    server.serve(listener, shutdown_rx).await
}
