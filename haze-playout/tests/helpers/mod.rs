//! Shared fixtures for haze-playout integration tests
//!
//! - `synthetic`: decoder backend producing constant-valued PCM per track
//! - `sinks`: capturing and failing output sinks
//! - engine builders and a render driver that waits for decode-ahead

#![allow(dead_code)]

pub mod sinks;
pub mod synthetic;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use haze_common::config::TransitionsConfig;
use haze_common::events::{EnginePhase, PlaylistSwitch};
use haze_common::{FadeCurve, PlayoutEvent, TransitionKind};
use haze_playout::audio::PcmFormat;
use haze_playout::playback::{
    ControllerSettings, EngineSettings, PlayoutController, SessionSettings, TransitionEngine,
};
use haze_playout::playlist::{Playlist, PlaylistSet, Track};

pub use sinks::{CaptureSink, Captured, FailingSink};
pub use synthetic::{Clip, Gate, SyntheticBackend};

/// 1 kHz mono keeps frame arithmetic readable: 1000 frames per second
pub const FORMAT: PcmFormat = PcmFormat {
    sample_rate: 1000,
    channels: 1,
};

pub const BLOCK_FRAMES: usize = 100;

pub fn transitions(kind: TransitionKind, secs: f64) -> TransitionsConfig {
    TransitionsConfig {
        default: kind,
        crossfade_duration: secs,
        fade_duration: secs,
        curve: FadeCurve::Linear,
        playlist_switch: PlaylistSwitch::FinishTrack,
    }
}

pub fn engine_settings(transitions: TransitionsConfig) -> EngineSettings {
    EngineSettings {
        format: FORMAT,
        session: SessionSettings {
            format: FORMAT,
            capacity_frames: 2_000,
            pull_frames: 250,
            start_timeout: Duration::from_secs(5),
            grace: Duration::from_millis(10),
        },
        lead_time_frames: 1_000,
        max_skips_per_boundary: 3,
        resume_fade_frames: 0,
        transitions,
    }
}

pub fn controller_settings(loop_playlist: bool) -> ControllerSettings {
    ControllerSettings {
        shuffle: false,
        shuffle_carry_over: 0,
        loop_playlist,
        playlist_switch: PlaylistSwitch::FinishTrack,
        seed: Some(7),
    }
}

/// Playlist of synthetic tracks named `<name>.wav`
pub fn playlist(name: &str, tracks: &[&str]) -> Playlist {
    Playlist::new(
        name,
        tracks
            .iter()
            .map(|t| Track::new(format!("/synthetic/{}.wav", t)))
            .collect(),
    )
}

pub fn engine(
    backend: SyntheticBackend,
    playlists: Vec<Playlist>,
    settings: EngineSettings,
    controller: ControllerSettings,
) -> TransitionEngine {
    let mut controller = PlayoutController::new(Arc::new(PlaylistSet::new(playlists)), controller);
    controller.activate_default(None);
    TransitionEngine::new(Arc::new(backend), settings, controller)
}

/// Block until every live session has `frames` buffered (or is done)
pub fn wait_primed(engine: &TransitionEngine, frames: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !engine.is_primed(frames) {
        assert!(Instant::now() < deadline, "decode-ahead never caught up");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Render one primed block
pub fn render_block(engine: &mut TransitionEngine) -> Vec<f32> {
    wait_primed(engine, BLOCK_FRAMES);
    let mut block = vec![0.0; FORMAT.samples(BLOCK_FRAMES)];
    engine.render(&mut block);
    block
}

/// Render primed blocks until the engine goes idle or stops
///
/// Returns the program output and every event emitted on the way.
pub fn render_to_end(
    engine: &mut TransitionEngine,
    max_blocks: usize,
) -> (Vec<f32>, Vec<PlayoutEvent>) {
    let mut output = Vec::new();
    let mut events = Vec::new();
    for _ in 0..max_blocks {
        output.extend(render_block(engine));
        events.extend(engine.drain_events());
        if matches!(engine.phase(), EnginePhase::Idle | EnginePhase::Stopped) {
            return (output, events);
        }
    }
    panic!("engine still {:?} after {} blocks", engine.phase(), max_blocks);
}

pub fn count_events(events: &[PlayoutEvent], event_type: &str) -> usize {
    events.iter().filter(|e| e.event_type() == event_type).count()
}

pub fn approx(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-4
}
