//! fwdgate CLI - allow-listed forward proxy
//!
//! Parses flags and environment variables, starts the proxy on a
//! multi-thread runtime and drains in-flight connections on shutdown.

mod cli;

use clap::Parser;
use cli::Cli;
use fwdgate_proxy::{ProxyConfig, ProxyError};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("Failed to start runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level / LOG_LEVEL
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("fwdgate: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns the process exit code: 0 when every connection drained in time.
fn run(cli: &Cli) -> Result<i32, CliError> {
    let config = cli.to_config()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("fwdgate")
        .build()
        .map_err(CliError::Runtime)?;
    runtime.block_on(serve(config, cli.shutdown_grace()))
}

async fn serve(config: ProxyConfig, grace: Duration) -> Result<i32, CliError> {
    let handle = fwdgate_proxy::start(config).await?;
    info!("fwdgate listening on {}", handle.addr);

    shutdown_signal().await?;
    handle.shutdown();
    info!(
        "Stopped accepting, draining {} connections",
        handle.active_connections()
    );

    if handle.drain(grace).await {
        info!("All connections drained");
        Ok(0)
    } else {
        warn!(
            "Forcing shutdown with {} connections still open",
            handle.active_connections()
        );
        Ok(1)
    }
}

async fn shutdown_signal() -> Result<(), CliError> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(CliError::Signal)?;
    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.map_err(CliError::Signal)?;
            info!("Received Ctrl+C");
        }
        _ = terminate => info!("Received SIGTERM"),
    }
    Ok(())
}
