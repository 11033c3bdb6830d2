//! Control events, status snapshots and broadcast events for Haze
//!
//! `ControlEvent` flows from operator interfaces into the playout engine.
//! `PlayoutStatus` and `PlayoutEvent` flow back out: the status is a full
//! snapshot read on demand, events are pushed to SSE subscribers as they
//! happen.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::fade_curves::FadeCurve;

/// Operator request, applied by the engine between mix ticks in arrival order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    Play,
    Pause,
    Next,
    Previous,
    SelectPlaylist { name: String },
    ToggleShuffle,
    Reload,
    SetSinkEnabled { sink: String, enabled: bool },
    /// Stop the engine and shut the sinks down
    Stop,
}

impl ControlEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::Play => "play",
            ControlEvent::Pause => "pause",
            ControlEvent::Next => "next",
            ControlEvent::Previous => "previous",
            ControlEvent::SelectPlaylist { .. } => "select_playlist",
            ControlEvent::ToggleShuffle => "toggle_shuffle",
            ControlEvent::Reload => "reload",
            ControlEvent::SetSinkEnabled { .. } => "set_sink_enabled",
            ControlEvent::Stop => "stop",
        }
    }
}

/// How one track hands over to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Instantaneous switch once the outgoing track is exhausted
    Cut,
    /// Outgoing track fades to silence, then the next track starts
    #[serde(alias = "fade")]
    FadeOut,
    /// Outgoing fades out while the incoming fades in, summed
    #[default]
    Crossfade,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Cut => "cut",
            TransitionKind::FadeOut => "fade_out",
            TransitionKind::Crossfade => "crossfade",
        }
    }
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cut" => Ok(TransitionKind::Cut),
            "fade_out" | "fadeout" | "fade-out" | "fade" => Ok(TransitionKind::FadeOut),
            "crossfade" | "cross_fade" | "xfade" => Ok(TransitionKind::Crossfade),
            other => Err(Error::Config(format!("unknown transition kind '{}'", other))),
        }
    }
}

/// When a newly selected playlist takes over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaylistSwitch {
    /// Queue the switch until the current track reaches its natural end
    #[default]
    FinishTrack,
    /// Cut over right away
    Immediate,
}

/// Operator-facing play/pause state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    #[default]
    Stopped,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackState::Playing => write!(f, "playing"),
            PlaybackState::Paused => write!(f, "paused"),
            PlaybackState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Coarse phase of the transition engine, as reported in status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    #[default]
    Idle,
    PlayingSingle,
    PreparingNext,
    Transitioning,
    Stopped,
}

/// Health of one output sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkHealth {
    #[default]
    Ok,
    /// Still writing, but blocks were dropped recently
    Degraded,
    /// Down; reconnect attempts in progress
    Failed,
}

impl fmt::Display for SinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkHealth::Ok => write!(f, "ok"),
            SinkHealth::Degraded => write!(f, "degraded"),
            SinkHealth::Failed => write!(f, "failed"),
        }
    }
}

/// Per-sink status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkStatusInfo {
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub health: SinkHealth,
    pub last_error: Option<String>,
    pub blocks_written: u64,
    pub blocks_dropped: u64,
    pub restarts: u64,
}

/// A track as shown to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub path: String,
    pub playlist: String,
    pub index: usize,
    pub duration_secs: Option<f64>,
    /// Embedded tags, once the file has been opened
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub has_art: bool,
}

/// The transition currently planned or in flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionInfo {
    pub kind: TransitionKind,
    pub duration_secs: f64,
    pub curve: FadeCurve,
    pub forced: bool,
}

/// Summary of one playlist for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistSummary {
    pub name: String,
    pub tracks: usize,
    pub source: String,
}

/// Full status snapshot of the playout engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayoutStatus {
    pub state: PlaybackState,
    pub phase: EnginePhase,
    pub playlist: Option<String>,
    pub pending_playlist: Option<String>,
    pub shuffle: bool,
    pub current: Option<TrackInfo>,
    pub next: Option<TrackInfo>,
    pub transition: Option<TransitionInfo>,
    /// Set when the engine stopped itself (e.g. every candidate track failed)
    pub halted_reason: Option<String>,
    pub sinks: Vec<SinkStatusInfo>,
    pub frames_played: u64,
    pub underrun_frames: u64,
    pub transitions_completed: u64,
    pub decode_failures: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for PlayoutStatus {
    fn default() -> Self {
        Self {
            state: PlaybackState::default(),
            phase: EnginePhase::default(),
            playlist: None,
            pending_playlist: None,
            shuffle: false,
            current: None,
            next: None,
            transition: None,
            halted_reason: None,
            sinks: Vec::new(),
            frames_played: 0,
            underrun_frames: 0,
            transitions_completed: 0,
            decode_failures: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Events broadcast to SSE subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayoutEvent {
    /// A track became the current program audio
    TrackStarted {
        track: TrackInfo,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// A fade or crossfade began
    TransitionStarted {
        from: TrackInfo,
        to: TrackInfo,
        transition: TransitionInfo,
        timestamp: DateTime<Utc>,
    },

    /// A fade or crossfade finished and the outgoing track was released
    TransitionCompleted {
        to: TrackInfo,
        timestamp: DateTime<Utc>,
    },

    PlaybackStateChanged {
        state: PlaybackState,
        timestamp: DateTime<Utc>,
    },

    /// Active playlist changed, or a switch was queued (`queued = true`)
    PlaylistChanged {
        name: String,
        queued: bool,
        timestamp: DateTime<Utc>,
    },

    ShuffleChanged {
        enabled: bool,
        timestamp: DateTime<Utc>,
    },

    PlaylistsReloaded {
        playlists: usize,
        timestamp: DateTime<Utc>,
    },

    /// A track could not be decoded and was skipped
    DecodeFailed {
        track: TrackInfo,
        error: String,
        timestamp: DateTime<Utc>,
    },

    SinkHealthChanged {
        sink: String,
        health: SinkHealth,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A control event was ignored because it made no sense in the current state
    ControlRejected {
        event: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Playback stopped on its own and outputs silence
    Halted {
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Non-looping playlist reached its end
    PlaylistEnded {
        name: String,
        timestamp: DateTime<Utc>,
    },
}

impl PlayoutEvent {
    /// Event type as string (SSE `event:` field)
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayoutEvent::TrackStarted { .. } => "TrackStarted",
            PlayoutEvent::TransitionStarted { .. } => "TransitionStarted",
            PlayoutEvent::TransitionCompleted { .. } => "TransitionCompleted",
            PlayoutEvent::PlaybackStateChanged { .. } => "PlaybackStateChanged",
            PlayoutEvent::PlaylistChanged { .. } => "PlaylistChanged",
            PlayoutEvent::ShuffleChanged { .. } => "ShuffleChanged",
            PlayoutEvent::PlaylistsReloaded { .. } => "PlaylistsReloaded",
            PlayoutEvent::DecodeFailed { .. } => "DecodeFailed",
            PlayoutEvent::SinkHealthChanged { .. } => "SinkHealthChanged",
            PlayoutEvent::ControlRejected { .. } => "ControlRejected",
            PlayoutEvent::Halted { .. } => "Halted",
            PlayoutEvent::PlaylistEnded { .. } => "PlaylistEnded",
        }
    }
}
