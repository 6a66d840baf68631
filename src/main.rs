//! hubtermd binary entry point.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hubterm::{build_router, AppState};

/// Web terminal bridge for driving hubctl setup flows from a browser.
#[derive(Parser, Debug)]
#[command(name = "hubtermd")]
#[command(about = "WebSocket PTY bridge for hubctl onboarding")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "HUBTERM_PORT", default_value_t = 18790)]
    port: u16,

    /// Executable launched for new sessions
    #[arg(long, env = "HUBTERM_BIN", default_value = "hubctl")]
    command: String,

    /// Directory of prebuilt frontend assets to serve
    #[arg(long, env = "HUBTERM_STATIC_DIR")]
    static_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state = AppState::new(args.command, args.static_dir);
    let app = build_router(state.clone());

    // All interfaces on purpose: the bridge fronts a container and must be
    // reachable from outside the host.
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind listening socket");
            std::process::exit(1);
        }
    };
    info!(%addr, command = %state.config.command, "listening");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received, terminating live sessions");
            state.registry.terminate_all().await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
