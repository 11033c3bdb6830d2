//! Configuration model, TOML loading and validation
//!
//! Every field has a default, so a missing or partial file still yields a
//! working configuration. The file is located in priority order:
//! 1. Command-line `--config` argument
//! 2. `HAZE_CONFIG` environment variable
//! 3. `./haze.toml`
//! 4. `<config_dir>/haze/config.toml` (platform config directory)
//! 5. Built-in defaults
//!
//! Configuration is read once at startup and fixed for the process lifetime.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{PlaylistSwitch, TransitionKind};
use crate::fade_curves::FadeCurve;
use crate::{Error, Result};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "HAZE_CONFIG";

/// Config file looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "haze.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub playout: PlayoutConfig,
    pub transitions: TransitionsConfig,
    pub outputs: OutputsConfig,
    pub web: WebConfig,
    pub paths: PathsConfig,
}

/// `[playout]` section: stream format, buffering and decode policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Playlist started at boot; first discovered playlist when unset
    pub default_playlist: Option<String>,
    pub shuffle: bool,
    /// Number of trailing tracks of one shuffle deck kept away from the head of the next
    pub shuffle_carry_over: usize,
    /// Wrap to the first track after the last one
    pub loop_playlist: bool,
    /// Frames produced per mix tick
    pub block_frames: usize,
    /// Decode-ahead ring buffer size per track
    pub ring_buffer_ms: u64,
    /// How far ahead of a boundary the next track is prepared
    pub lead_time_secs: f64,
    /// Longest a freshly spawned decoder may take to deliver audio
    pub start_timeout_secs: f64,
    /// Consecutive decode failures tolerated at one boundary before halting
    pub max_skips_per_boundary: usize,
    /// Longest a single read from a running decoder may block
    pub decode_read_timeout_secs: f64,
    /// Time a decoder gets to exit after being told to stop, before it is killed
    pub decoder_grace_ms: u64,
    /// Fade-in applied when resuming from pause
    pub resume_fade_ms: u64,
    pub shutdown_timeout_secs: f64,
    pub ffmpeg_path: String,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            default_playlist: None,
            shuffle: false,
            shuffle_carry_over: 3,
            loop_playlist: true,
            block_frames: 1024,
            ring_buffer_ms: 500,
            lead_time_secs: 5.0,
            start_timeout_secs: 5.0,
            max_skips_per_boundary: 5,
            decode_read_timeout_secs: 5.0,
            decoder_grace_ms: 500,
            resume_fade_ms: 50,
            shutdown_timeout_secs: 3.0,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl PlayoutConfig {
    /// Ring buffer capacity in frames
    pub fn ring_buffer_frames(&self) -> usize {
        (self.sample_rate as u64 * self.ring_buffer_ms / 1000) as usize
    }

    pub fn lead_time_frames(&self) -> u64 {
        secs_to_frames(self.lead_time_secs, self.sample_rate)
    }

    pub fn resume_fade_frames(&self) -> u64 {
        self.sample_rate as u64 * self.resume_fade_ms / 1000
    }

    /// Wall-clock duration of one mix tick
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn start_timeout(&self) -> Duration {
        secs(self.start_timeout_secs)
    }

    pub fn decode_read_timeout(&self) -> Duration {
        secs(self.decode_read_timeout_secs)
    }

    pub fn decoder_grace(&self) -> Duration {
        Duration::from_millis(self.decoder_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }
}

/// `[transitions]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionsConfig {
    pub default: TransitionKind,
    pub crossfade_duration: f64,
    pub fade_duration: f64,
    pub curve: FadeCurve,
    pub playlist_switch: PlaylistSwitch,
}

impl Default for TransitionsConfig {
    fn default() -> Self {
        Self {
            default: TransitionKind::Crossfade,
            crossfade_duration: 2.0,
            fade_duration: 2.0,
            curve: FadeCurve::EqualPower,
            playlist_switch: PlaylistSwitch::FinishTrack,
        }
    }
}

impl TransitionsConfig {
    /// Configured duration for a transition kind, in seconds (0 for cuts)
    pub fn duration_for(&self, kind: TransitionKind) -> f64 {
        match kind {
            TransitionKind::Cut => 0.0,
            TransitionKind::FadeOut => self.fade_duration,
            TransitionKind::Crossfade => self.crossfade_duration,
        }
    }
}

/// `[outputs]` section: every sink the program stream fans out to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputsConfig {
    pub soundcard: SoundcardConfig,
    pub network: Vec<NetworkSinkConfig>,
    pub recovery: RecoveryConfig,
}

/// `[outputs.soundcard]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoundcardConfig {
    pub enabled: bool,
    /// Output device name; system default when unset
    pub device: Option<String>,
    pub queue_blocks: usize,
}

impl Default for SoundcardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: None,
            queue_blocks: 16,
        }
    }
}

/// `[[outputs.network]]`: one encoded UDP stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSinkConfig {
    pub name: Option<String>,
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub codec: String,
    pub bitrate: String,
    pub format: String,
    pub queue_blocks: usize,
}

impl Default for NetworkSinkConfig {
    fn default() -> Self {
        Self {
            name: None,
            enabled: true,
            host: String::new(),
            port: 0,
            codec: "aac".to_string(),
            bitrate: "192k".to_string(),
            format: "mpegts".to_string(),
            queue_blocks: 32,
        }
    }
}

impl NetworkSinkConfig {
    /// Sink name, falling back to `udp://host:port`
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("udp://{}:{}", self.host, self.port),
        }
    }
}

/// `[outputs.recovery]`: reconnect backoff for failed sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

impl RecoveryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// `[web]`: operator HTTP API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// `[paths]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub playlists_dir: PathBuf,
    /// Status file rewritten on every track start; disabled when unset
    pub now_playing_file: Option<PathBuf>,
    /// Embedded cover picture of the current track, written as-is
    pub now_playing_art_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            playlists_dir: PathBuf::from("Managed/Playlists"),
            now_playing_file: Some(PathBuf::from("now_playing.txt")),
            now_playing_art_file: Some(PathBuf::from("now_playing_art.jpg")),
        }
    }
}

impl Config {
    /// Parse configuration from TOML text (not validated)
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Locate, read and validate the configuration
    ///
    /// An explicitly named file (CLI or environment) must exist. When no file
    /// is found at the implicit locations, defaults are used with a warning.
    /// Returns the config and the file it came from, if any.
    pub fn load(cli_path: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let env_path = std::env::var(CONFIG_ENV_VAR).ok();
        match resolve_config_path(cli_path, env_path.as_deref()) {
            ConfigLocation::Explicit(path) => {
                let config = Self::from_file(&path)?;
                info!("Loaded configuration from {}", path.display());
                Ok((config, Some(path)))
            }
            ConfigLocation::Discovered(path) => {
                let config = Self::from_file(&path)?;
                info!("Loaded configuration from {}", path.display());
                Ok((config, Some(path)))
            }
            ConfigLocation::Defaults => {
                warn!("No configuration file found, using built-in defaults");
                let config = Self::default();
                config.validate()?;
                Ok((config, None))
            }
        }
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let p = &self.playout;
        if !(8_000..=192_000).contains(&p.sample_rate) {
            return Err(invalid(format!(
                "playout.sample_rate {} outside 8000..=192000",
                p.sample_rate
            )));
        }
        if !(1..=8).contains(&p.channels) {
            return Err(invalid(format!("playout.channels {} outside 1..=8", p.channels)));
        }
        if p.block_frames == 0 {
            return Err(invalid("playout.block_frames must be positive"));
        }
        if p.ring_buffer_ms == 0 {
            return Err(invalid("playout.ring_buffer_ms must be positive"));
        }
        if p.ring_buffer_frames() < p.block_frames {
            return Err(invalid(format!(
                "playout.ring_buffer_ms {} holds fewer frames than one block ({})",
                p.ring_buffer_ms, p.block_frames
            )));
        }
        if p.max_skips_per_boundary == 0 {
            return Err(invalid("playout.max_skips_per_boundary must be at least 1"));
        }
        non_negative("playout.lead_time_secs", p.lead_time_secs)?;
        positive("playout.start_timeout_secs", p.start_timeout_secs)?;
        positive("playout.decode_read_timeout_secs", p.decode_read_timeout_secs)?;
        non_negative("playout.shutdown_timeout_secs", p.shutdown_timeout_secs)?;
        if p.ffmpeg_path.trim().is_empty() {
            return Err(invalid("playout.ffmpeg_path must not be empty"));
        }

        let t = &self.transitions;
        non_negative("transitions.crossfade_duration", t.crossfade_duration)?;
        non_negative("transitions.fade_duration", t.fade_duration)?;

        let o = &self.outputs;
        if o.soundcard.queue_blocks == 0 {
            return Err(invalid("outputs.soundcard.queue_blocks must be positive"));
        }
        if o.recovery.initial_backoff_ms == 0 {
            return Err(invalid("outputs.recovery.initial_backoff_ms must be positive"));
        }
        if o.recovery.max_backoff_ms < o.recovery.initial_backoff_ms {
            return Err(invalid(
                "outputs.recovery.max_backoff_ms must not be below initial_backoff_ms",
            ));
        }

        let mut names = HashSet::new();
        if o.soundcard.enabled {
            names.insert("soundcard".to_string());
        }
        for net in &o.network {
            let name = net.display_name();
            if net.host.trim().is_empty() {
                return Err(invalid(format!("network sink '{}' has an empty host", name)));
            }
            if net.port == 0 {
                return Err(invalid(format!("network sink '{}' has port 0", name)));
            }
            if net.queue_blocks == 0 {
                return Err(invalid(format!(
                    "network sink '{}' queue_blocks must be positive",
                    name
                )));
            }
            if !names.insert(name.clone()) {
                return Err(invalid(format!("duplicate sink name '{}'", name)));
            }
        }

        if self.web.enabled && self.web.port == 0 {
            return Err(invalid("web.port must not be 0 when the web API is enabled"));
        }

        Ok(())
    }
}

/// Where configuration should be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigLocation {
    /// Named on the command line or in `HAZE_CONFIG`
    Explicit(PathBuf),
    /// Found at one of the implicit locations
    Discovered(PathBuf),
    Defaults,
}

/// Resolve the config file location
///
/// `env_value` is the value of `HAZE_CONFIG`, passed in so callers (and tests)
/// control the environment lookup.
pub fn resolve_config_path(cli_path: Option<&Path>, env_value: Option<&str>) -> ConfigLocation {
    if let Some(path) = cli_path {
        return ConfigLocation::Explicit(path.to_path_buf());
    }

    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return ConfigLocation::Explicit(PathBuf::from(value));
    }

    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return ConfigLocation::Discovered(local);
    }

    if let Some(user) = dirs::config_dir().map(|d| d.join("haze").join("config.toml")) {
        if user.is_file() {
            return ConfigLocation::Discovered(user);
        }
    }

    ConfigLocation::Defaults
}

/// Seconds to whole frames at `sample_rate` (negative and NaN map to 0)
pub fn secs_to_frames(secs: f64, sample_rate: u32) -> u64 {
    if !secs.is_finite() || secs <= 0.0 {
        return 0;
    }
    (secs * sample_rate as f64).round() as u64
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::Config(msg.into())
}

fn non_negative(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(format!("{} must be a non-negative number, got {}", field, value)));
    }
    Ok(())
}

fn positive(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(invalid(format!("{} must be a positive number, got {}", field, value)));
    }
    Ok(())
}
