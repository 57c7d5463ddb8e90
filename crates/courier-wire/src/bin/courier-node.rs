//! Reference overlay node process.
//!
//! Started by the overlay connection with the env file path as its first
//! argument; falls back to the process environment when none is given.

use clap::Parser;
use courier_wire::mesh;
use courier_wire::pipe::RetryPolicy;
use courier_wire::NodeEnv;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "courier-node", version, about = "Courier overlay node")]
struct Cli {
    /// Env file written by the connection manager.
    env_file: Option<PathBuf>,

    /// Attempts to open the pipe back to the agent.
    #[arg(long, default_value_t = 30)]
    pipe_open_attempts: u32,

    /// Milliseconds between those attempts.
    #[arg(long, default_value_t = 200)]
    pipe_open_backoff_ms: u64,
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing_stderr();
    let cli = Cli::parse();

    let env = match &cli.env_file {
        Some(path) => NodeEnv::from_file(path),
        None => NodeEnv::from_process_env(),
    };
    let env = match env {
        Ok(env) => env,
        Err(e) => {
            tracing::error!("Cannot start node: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    let retry = RetryPolicy::new(
        cli.pipe_open_attempts,
        Duration::from_millis(cli.pipe_open_backoff_ms),
    );
    match mesh::run_until(env, retry, shutdown_signal()).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Node failed: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}
