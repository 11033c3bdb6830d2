//! Playout runtime
//!
//! Runs the transition engine on a periodic timer, one block per tick, and
//! hands every block to the sink fan-out. Control events arrive on an
//! unbounded channel and are applied between ticks in arrival order.
//! After each tick the status snapshot in [`SharedState`] is refreshed and
//! engine events are broadcast for SSE subscribers.
//!
//! Playlist reloads scan the filesystem on the blocking pool; the result is
//! installed on a later tick, so a slow scan never stalls the output.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use haze_common::events::{ControlEvent, PlayoutEvent, SinkHealth};
use haze_common::Config;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::transition::TransitionEngine;
use crate::audio::{DecoderBackend, FfmpegDecoder, PcmFormat};
use crate::error::{Error, Result};
use crate::now_playing;
use crate::playlist::{self, PlaylistSet};
use crate::sinks::{Backoff, DeviceSink, Fanout, NetworkSink, OutputSink, SinkSpec};
use crate::state::SharedState;

/// Runtime parameters that do not concern the transition engine itself
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub block_frames: usize,
    pub block_duration: Duration,
    pub shutdown_timeout: Duration,
    pub playlists_dir: PathBuf,
    pub now_playing_file: Option<PathBuf>,
    pub now_playing_art_file: Option<PathBuf>,
    /// Start playing as soon as the runtime starts
    pub autoplay: bool,
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            block_frames: config.playout.block_frames,
            block_duration: config.playout.block_duration(),
            shutdown_timeout: config.playout.shutdown_timeout(),
            playlists_dir: config.paths.playlists_dir.clone(),
            now_playing_file: config.paths.now_playing_file.clone(),
            now_playing_art_file: config.paths.now_playing_art_file.clone(),
            autoplay: true,
        }
    }
}

/// Cloneable sender side used by the HTTP layer
#[derive(Clone)]
pub struct PlayoutHandle {
    tx: mpsc::UnboundedSender<ControlEvent>,
    state: Arc<SharedState>,
}

impl PlayoutHandle {
    /// Queue a control event for the next tick boundary
    pub fn send(&self, event: ControlEvent) -> Result<()> {
        debug!("Queueing control event: {}", event.name());
        self.tx
            .send(event)
            .map_err(|_| Error::InvalidState("playout engine is not running".to_string()))
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }
}

pub struct PlayoutEngine {
    engine: TransitionEngine,
    fanout: Fanout,
    state: Arc<SharedState>,
    options: RuntimeOptions,
    rx: mpsc::UnboundedReceiver<ControlEvent>,
    reload_tx: mpsc::UnboundedSender<Result<PlaylistSet>>,
    reload_rx: mpsc::UnboundedReceiver<Result<PlaylistSet>>,
    reload_pending: bool,
    sink_health: HashMap<String, SinkHealth>,
}

impl PlayoutEngine {
    pub fn new(
        engine: TransitionEngine,
        fanout: Fanout,
        state: Arc<SharedState>,
        options: RuntimeOptions,
    ) -> (Self, PlayoutHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let handle = PlayoutHandle {
            tx,
            state: Arc::clone(&state),
        };
        let runtime = Self {
            engine,
            fanout,
            state,
            options,
            rx,
            reload_tx,
            reload_rx,
            reload_pending: false,
            sink_health: HashMap::new(),
        };
        (runtime, handle)
    }

    /// Wire up the ffmpeg decoder and the configured sinks
    pub fn from_config(
        config: &Config,
        set: PlaylistSet,
        state: Arc<SharedState>,
    ) -> Result<(Self, PlayoutHandle)> {
        let backend: Arc<dyn DecoderBackend> = Arc::new(FfmpegDecoder::new(
            config.playout.ffmpeg_path.clone(),
            config.playout.decode_read_timeout(),
        ));
        let engine = TransitionEngine::from_config(backend, config, Arc::new(set));
        let fanout = build_fanout(config)?;
        Ok(Self::new(
            engine,
            fanout,
            state,
            RuntimeOptions::from_config(config),
        ))
    }

    pub fn engine(&self) -> &TransitionEngine {
        &self.engine
    }

    /// Run until a `Stop` event arrives or every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Playout running: {} Hz, {} channels, {} frames per block",
            self.engine.format().sample_rate,
            self.engine.format().channels,
            self.options.block_frames
        );
        self.state
            .set_playlists(self.engine.controller().playlists().summaries())
            .await;

        if self.options.autoplay {
            self.apply(ControlEvent::Play);
        }

        let mut ticker = interval(self.options.block_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Some(ControlEvent::Stop) | None => break,
                    Some(event) => self.apply(event),
                },
                Some(result) = self.reload_rx.recv() => self.finish_reload(result).await,
                _ = ticker.tick() => self.tick().await,
            }
        }

        self.shutdown().await;
    }

    /// Apply one control event to the engine
    pub fn apply(&mut self, event: ControlEvent) {
        let name = event.name();
        let outcome = match event {
            ControlEvent::Play => self.engine.play(),
            ControlEvent::Pause => self.engine.pause(),
            ControlEvent::Next => self.engine.skip_next(),
            ControlEvent::Previous => self.engine.skip_previous(),
            ControlEvent::SelectPlaylist { name } => {
                self.engine.select_playlist(&name).map(|_| ())
            }
            ControlEvent::ToggleShuffle => {
                self.engine.toggle_shuffle();
                Ok(())
            }
            ControlEvent::Reload => self.start_reload(),
            ControlEvent::SetSinkEnabled { sink, enabled } => {
                self.fanout.set_enabled(&sink, enabled)
            }
            ControlEvent::Stop => {
                self.engine.shutdown();
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!("Rejected {} event: {}", name, e);
            self.state.broadcast_event(PlayoutEvent::ControlRejected {
                event: name.to_string(),
                reason: e.to_string(),
                timestamp: Utc::now(),
            });
        }
        self.publish_events();
    }

    /// Render one block, hand it to the sinks, and refresh the status
    pub async fn tick(&mut self) {
        let format = self.engine.format();
        let mut block = vec![0.0f32; format.samples(self.options.block_frames)];
        self.engine.render(&mut block);
        self.fanout.push(Arc::from(block));

        self.publish_events();
        self.check_sink_health();

        let mut status = self.engine.status();
        status.sinks = self.fanout.statuses();
        self.state.set_status(status).await;
    }

    fn start_reload(&mut self) -> Result<()> {
        if self.reload_pending {
            return Err(Error::InvalidState("reload already in progress".to_string()));
        }
        self.reload_pending = true;
        let dir = self.options.playlists_dir.clone();
        let tx = self.reload_tx.clone();
        info!("Rescanning playlists in {}", dir.display());
        tokio::task::spawn_blocking(move || deliver_rescan(&dir, &tx));
        Ok(())
    }

    async fn finish_reload(&mut self, result: Result<PlaylistSet>) {
        self.reload_pending = false;
        match result {
            Ok(set) => {
                let summaries = set.summaries();
                self.engine.reload(Arc::new(set));
                self.state.set_playlists(summaries).await;
            }
            Err(e) => {
                warn!("Playlist reload failed, keeping current set: {}", e);
                self.state.broadcast_event(PlayoutEvent::ControlRejected {
                    event: ControlEvent::Reload.name().to_string(),
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }
        self.publish_events();
    }

    fn publish_events(&mut self) {
        for event in self.engine.drain_events() {
            if let PlayoutEvent::TrackStarted {
                track, session_id, ..
            } = &event
            {
                let text = self.options.now_playing_file.clone();
                let art = self.options.now_playing_art_file.clone();
                if text.is_some() || art.is_some() {
                    let track = track.clone();
                    let tags = self.engine.session_tags(*session_id);
                    tokio::task::spawn_blocking(move || {
                        if let Some(path) = text {
                            if let Err(e) = now_playing::write(&path, &track) {
                                debug!("Failed to write {}: {}", path.display(), e);
                            }
                        }
                        if let Some(path) = art {
                            let cover = tags.as_ref().and_then(|t| t.art.as_ref());
                            if let Err(e) = now_playing::write_art(&path, cover) {
                                debug!("Failed to write {}: {}", path.display(), e);
                            }
                        }
                    });
                }
            }
            self.state.broadcast_event(event);
        }
    }

    fn check_sink_health(&mut self) {
        for info in self.fanout.statuses() {
            let previous = self.sink_health.insert(info.name.clone(), info.health);
            if previous.is_some_and(|p| p != info.health)
                || (previous.is_none() && info.health != SinkHealth::Ok)
            {
                self.state.broadcast_event(PlayoutEvent::SinkHealthChanged {
                    sink: info.name,
                    health: info.health,
                    error: info.last_error,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    async fn shutdown(mut self) {
        info!("Stopping playout");
        self.engine.shutdown();
        self.publish_events();

        let mut status = self.engine.status();
        status.sinks = self.fanout.statuses();
        self.state.set_status(status).await;

        let timeout = self.options.shutdown_timeout;
        let mut fanout = self.fanout;
        let joined = tokio::task::spawn_blocking(move || fanout.shutdown(timeout)).await;
        if let Err(e) = joined {
            warn!("Sink shutdown task failed: {}", e);
        }
        info!("Playout stopped");
    }
}

/// Scan `dir` and hand the result to the runtime
///
/// Returns `false` when the runtime has already gone away.
fn deliver_rescan(dir: &Path, tx: &mpsc::UnboundedSender<Result<PlaylistSet>>) -> bool {
    if tx.send(playlist::discover(dir)).is_err() {
        debug!("Playout stopped before the rescan of {} finished", dir.display());
        return false;
    }
    true
}

/// Create the fan-out with the sound card and every configured network sink
pub fn build_fanout(config: &Config) -> Result<Fanout> {
    let format = PcmFormat::new(config.playout.sample_rate, config.playout.channels);
    let backoff = Backoff::from_config(&config.outputs.recovery);
    let mut fanout = Fanout::new();

    let soundcard = &config.outputs.soundcard;
    if soundcard.enabled {
        let device = soundcard.device.clone();
        fanout.add(
            SinkSpec {
                name: "soundcard".to_string(),
                kind: "device".to_string(),
                queue_blocks: soundcard.queue_blocks,
                enabled: true,
                factory: Box::new(move || -> Box<dyn OutputSink> {
                    Box::new(DeviceSink::new(device, format))
                }),
            },
            backoff,
        )?;
    }

    for network in &config.outputs.network {
        let sink_config = network.clone();
        let ffmpeg_path = config.playout.ffmpeg_path.clone();
        let grace = config.playout.decoder_grace();
        fanout.add(
            SinkSpec {
                name: network.display_name(),
                kind: "network".to_string(),
                queue_blocks: network.queue_blocks,
                enabled: network.enabled,
                factory: Box::new(move || -> Box<dyn OutputSink> {
                    Box::new(NetworkSink::new(sink_config, format, ffmpeg_path, grace))
                }),
            },
            backoff,
        )?;
    }

    if fanout.is_empty() {
        warn!("No output sinks configured; audio is mixed but not played");
    }
    Ok(fanout)
}
