//! Haze playout engine (haze-playout) - Main entry point
//!
//! Loads the configuration, discovers playlists, starts the playout runtime
//! and serves the control API until SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use haze_common::{Config, ControlEvent};
use haze_playout::api::{self, AppContext};
use haze_playout::playback::PlayoutEngine;
use haze_playout::{playlist, SharedState};
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for haze-playout
#[derive(Parser, Debug)]
#[command(name = "haze-playout")]
#[command(about = "Continuous audio playout with crossfades and multi-sink output")]
#[command(version)]
struct Args {
    /// Configuration file (TOML); also read from HAZE_CONFIG
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory scanned for playlists
    #[arg(long, env = "HAZE_PLAYLISTS_DIR")]
    playlists_dir: Option<PathBuf>,

    /// Port for the HTTP control API
    #[arg(short, long, env = "HAZE_PORT")]
    port: Option<u16>,

    /// Do not start the HTTP control API
    #[arg(long)]
    no_web: bool,

    /// Do not open the local sound card
    #[arg(long)]
    no_soundcard: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.playlists_dir {
            config.paths.playlists_dir = dir.clone();
        }
        if let Some(port) = self.port {
            config.web.port = port;
        }
        if self.no_web {
            config.web.enabled = false;
        }
        if self.no_soundcard {
            config.outputs.soundcard.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haze_playout=info,haze_common=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let (mut config, source) =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        "Starting Haze playout v{} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("HAZE_GIT_HASH")
    );
    match &source {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: built-in defaults"),
    }
    info!(
        "Output format: {} Hz, {} channels",
        config.playout.sample_rate, config.playout.channels
    );

    let set = playlist::discover(&config.paths.playlists_dir).with_context(|| {
        format!(
            "Failed to scan playlists in {}",
            config.paths.playlists_dir.display()
        )
    })?;
    if set.is_empty() {
        warn!(
            "No playlists found in {}; output stays silent until a reload finds some",
            config.paths.playlists_dir.display()
        );
    } else {
        info!("Found {} playlists: {}", set.len(), set.names().join(", "));
    }

    let state = Arc::new(SharedState::new());
    let (engine, handle) = PlayoutEngine::from_config(&config, set, Arc::clone(&state))
        .context("Failed to initialize playout engine")?;
    let playout = tokio::spawn(engine.run());

    let served = if config.web.enabled {
        api::run(&config.web, AppContext::new(handle.clone()), shutdown_signal())
            .await
            .context("HTTP server failed")
    } else {
        info!("HTTP control API disabled");
        shutdown_signal().await;
        Ok(())
    };

    if let Err(e) = handle.send(ControlEvent::Stop) {
        debug!("Playout already stopped: {}", e);
    }
    playout.await.context("Playout task failed")?;
    served?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
