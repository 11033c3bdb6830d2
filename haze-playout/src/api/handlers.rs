//! HTTP request handlers
//!
//! Commands answer `202 Accepted` once the event is queued; the outcome is
//! visible in the status snapshot and on the event stream. A command the
//! engine cannot apply shows up there as `ControlRejected`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use haze_common::events::{PlaylistSummary, PlayoutStatus};
use haze_common::ControlEvent;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::api::server::AppContext;
use crate::error::Error;
use crate::sinks::DeviceSink;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: String,
    module: String,
    version: String,
    git_hash: String,
    build_timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlaylistsResponse {
    active: Option<String>,
    pending: Option<String>,
    playlists: Vec<PlaylistSummary>,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    devices: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SinkEnabledRequest {
    enabled: bool,
}

type CommandResult = Result<(StatusCode, Json<StatusResponse>), (StatusCode, Json<StatusResponse>)>;

// ============================================================================
// Health and status
// ============================================================================

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        module: "haze-playout".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: env!("HAZE_GIT_HASH").to_string(),
        build_timestamp: env!("HAZE_BUILD_TIMESTAMP").to_string(),
    })
}

/// GET /api/v1/status - full status snapshot
pub async fn get_status(State(ctx): State<AppContext>) -> Json<PlayoutStatus> {
    Json(ctx.state.get_status().await)
}

/// GET /api/v1/playlists
pub async fn list_playlists(State(ctx): State<AppContext>) -> Json<PlaylistsResponse> {
    let status = ctx.state.get_status().await;
    Json(PlaylistsResponse {
        active: status.playlist,
        pending: status.pending_playlist,
        playlists: ctx.state.get_playlists().await,
    })
}

/// GET /api/v1/sinks/devices - output devices the sound card sink can use
pub async fn list_audio_devices() -> Result<Json<DeviceListResponse>, (StatusCode, Json<StatusResponse>)> {
    // Enumeration talks to the audio host and may block
    let listed = match tokio::task::spawn_blocking(DeviceSink::list_devices).await {
        Ok(listed) => listed,
        Err(e) => Err(Error::Sink(format!("device enumeration task failed: {}", e))),
    };
    match listed {
        Ok(devices) => {
            info!("Found {} audio devices", devices.len());
            Ok(Json(DeviceListResponse { devices }))
        }
        Err(e) => {
            error!("Failed to list audio devices: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(StatusResponse {
                    status: "error".to_string(),
                    event: None,
                    error: Some(e.to_string()),
                }),
            ))
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

fn submit(ctx: &AppContext, event: ControlEvent) -> CommandResult {
    let name = event.name();
    match ctx.handle.send(event) {
        Ok(()) => {
            info!("Accepted {} command", name);
            Ok((
                StatusCode::ACCEPTED,
                Json(StatusResponse {
                    status: "accepted".to_string(),
                    event: Some(name.to_string()),
                    error: None,
                }),
            ))
        }
        Err(e) => {
            error!("{} command failed: {}", name, e);
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StatusResponse {
                    status: "error".to_string(),
                    event: Some(name.to_string()),
                    error: Some(e.to_string()),
                }),
            ))
        }
    }
}

/// POST /api/v1/playback/play
pub async fn play(State(ctx): State<AppContext>) -> CommandResult {
    submit(&ctx, ControlEvent::Play)
}

/// POST /api/v1/playback/pause
pub async fn pause(State(ctx): State<AppContext>) -> CommandResult {
    submit(&ctx, ControlEvent::Pause)
}

/// POST /api/v1/playback/next
pub async fn skip_next(State(ctx): State<AppContext>) -> CommandResult {
    submit(&ctx, ControlEvent::Next)
}

/// POST /api/v1/playback/previous
pub async fn skip_previous(State(ctx): State<AppContext>) -> CommandResult {
    submit(&ctx, ControlEvent::Previous)
}

/// POST /api/v1/playback/shuffle - toggle
pub async fn toggle_shuffle(State(ctx): State<AppContext>) -> CommandResult {
    submit(&ctx, ControlEvent::ToggleShuffle)
}

/// POST /api/v1/playlists/reload
pub async fn reload_playlists(State(ctx): State<AppContext>) -> CommandResult {
    submit(&ctx, ControlEvent::Reload)
}

/// POST /api/v1/playlists/:name/select
pub async fn select_playlist(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> CommandResult {
    submit(&ctx, ControlEvent::SelectPlaylist { name })
}

/// POST /api/v1/sinks/:name/enabled
pub async fn set_sink_enabled(
    State(ctx): State<AppContext>,
    Path(sink): Path<String>,
    Json(req): Json<SinkEnabledRequest>,
) -> CommandResult {
    submit(
        &ctx,
        ControlEvent::SetSinkEnabled {
            sink,
            enabled: req.enabled,
        },
    )
}
