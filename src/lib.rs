//! hubterm: a WebSocket bridge that runs an interactive CLI inside a
//! pseudo-terminal and streams the terminal to a remote client.
//!
//! The bridge fronts `hubctl` (or any configured binary): a browser terminal
//! connects to `/ws`, starts a session, and drives the CLI's interactive
//! setup flows as if attached to its terminal.

pub mod http;
pub mod protocol;
pub mod pty;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{any, get};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::pty::registry::SessionRegistry;

/// Server-wide configuration resolved at startup.
#[derive(Debug)]
pub struct ServerConfig {
    /// Executable spawned for new sessions unless the client overrides it.
    pub command: String,
    /// Frontend asset directory; static serving is disabled when unset.
    pub static_dir: Option<PathBuf>,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(command: String, static_dir: Option<PathBuf>) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new()),
            config: Arc::new(ServerConfig {
                command,
                static_dir,
            }),
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(http::health))
        .route("/api/commands", get(http::commands))
        .route("/ws", any(ws::ws_handler));

    // Unmatched GET routes fall through to the frontend bundle, with an SPA
    // fallback to index.html for client-side routes.
    if let Some(dir) = state.config.static_dir.clone() {
        let index = dir.join("index.html");
        router = router.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
