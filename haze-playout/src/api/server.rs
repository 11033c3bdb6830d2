//! HTTP server setup and routing

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use haze_common::config::WebConfig;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};
use crate::playback::PlayoutHandle;
use crate::state::SharedState;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub handle: PlayoutHandle,
    pub state: Arc<SharedState>,
}

impl AppContext {
    pub fn new(handle: PlayoutHandle) -> Self {
        let state = Arc::clone(handle.state());
        Self { handle, state }
    }
}

/// Build the router with every endpoint attached
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(super::handlers::health))
        .nest(
            "/api/v1",
            Router::new()
                // Status
                .route("/status", get(super::handlers::get_status))
                // Playback control
                .route("/playback/play", post(super::handlers::play))
                .route("/playback/pause", post(super::handlers::pause))
                .route("/playback/next", post(super::handlers::skip_next))
                .route("/playback/previous", post(super::handlers::skip_previous))
                .route("/playback/shuffle", post(super::handlers::toggle_shuffle))
                // Playlists
                .route("/playlists", get(super::handlers::list_playlists))
                .route("/playlists/reload", post(super::handlers::reload_playlists))
                .route("/playlists/:name/select", post(super::handlers::select_playlist))
                // Sinks
                .route("/sinks/devices", get(super::handlers::list_audio_devices))
                .route("/sinks/:name/enabled", post(super::handlers::set_sink_enabled))
                // SSE event stream
                .route("/events", get(super::sse::event_stream)),
        )
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the API until `shutdown` resolves
pub async fn run(
    config: &WebConfig,
    ctx: AppContext,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let ip = config
        .host
        .parse::<std::net::IpAddr>()
        .map_err(|e| Error::Http(format!("Invalid web.host '{}': {}", config.host, e)))?;
    let addr = SocketAddr::new(ip, config.port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Starting HTTP server on {}", addr);

    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))?;

    info!("HTTP server stopped");
    Ok(())
}
