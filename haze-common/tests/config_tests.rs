//! Configuration loading and validation tests
//!
//! Covers TOML parsing with partial files, default filling, explicit file
//! resolution and the validation rules that must reject a config before the
//! engine starts.

use std::io::Write;
use std::path::{Path, PathBuf};

use haze_common::config::{resolve_config_path, Config, ConfigLocation};
use haze_common::events::{PlaylistSwitch, TransitionKind};
use haze_common::{Error, FadeCurve};
use tempfile::NamedTempFile;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn assert_config_error(config: &Config, needle: &str) {
    match config.validate() {
        Err(Error::Config(msg)) => assert!(
            msg.contains(needle),
            "expected error mentioning '{needle}', got '{msg}'"
        ),
        other => panic!("expected config error mentioning '{needle}', got {other:?}"),
    }
}

#[test]
fn test_empty_file_yields_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config, Config::default());
    config.validate().unwrap();
}

#[test]
fn test_full_file_parses() {
    let text = r#"
        [playout]
        sample_rate = 44100
        channels = 2
        default_playlist = "Morning"
        shuffle = true
        shuffle_carry_over = 2
        lead_time_secs = 8.0

        [transitions]
        default = "fade_out"
        crossfade_duration = 3.5
        fade_duration = 1.0
        curve = "s_curve"
        playlist_switch = "immediate"

        [outputs.soundcard]
        enabled = false

        [[outputs.network]]
        name = "studio"
        host = "10.0.0.5"
        port = 5004
        codec = "libmp3lame"
        bitrate = "128k"

        [[outputs.network]]
        host = "239.1.1.1"
        port = 6000

        [outputs.recovery]
        initial_backoff_ms = 100
        max_backoff_ms = 2000

        [web]
        port = 9090

        [paths]
        playlists_dir = "/srv/playlists"
    "#;

    let config = Config::from_toml_str(text).unwrap();
    config.validate().unwrap();

    assert_eq!(config.playout.sample_rate, 44_100);
    assert_eq!(config.playout.default_playlist.as_deref(), Some("Morning"));
    assert!(config.playout.shuffle);
    assert_eq!(config.playout.shuffle_carry_over, 2);
    assert_eq!(config.transitions.default, TransitionKind::FadeOut);
    assert_eq!(config.transitions.curve, FadeCurve::SCurve);
    assert_eq!(config.transitions.playlist_switch, PlaylistSwitch::Immediate);
    assert!(!config.outputs.soundcard.enabled);
    assert_eq!(config.outputs.network.len(), 2);
    assert_eq!(config.outputs.network[0].display_name(), "studio");
    assert_eq!(config.outputs.network[0].format, "mpegts");
    assert_eq!(config.outputs.network[1].display_name(), "udp://239.1.1.1:6000");
    assert_eq!(config.outputs.recovery.max_backoff_ms, 2000);
    assert_eq!(config.web.port, 9090);
    assert_eq!(config.paths.playlists_dir, PathBuf::from("/srv/playlists"));
    // Untouched fields keep their defaults
    assert_eq!(config.playout.block_frames, 1024);
    assert!(config.paths.now_playing_file.is_some());
    assert_eq!(
        config.paths.now_playing_art_file,
        Some(PathBuf::from("now_playing_art.jpg"))
    );
}

#[test]
fn test_unknown_transition_kind_is_rejected() {
    let err = Config::from_toml_str("[transitions]\ndefault = \"dissolve\"\n").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_unknown_curve_is_rejected() {
    let err = Config::from_toml_str("[transitions]\ncurve = \"wobbly\"\n").unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_sample_rate_bounds() {
    let mut config = Config::default();
    config.playout.sample_rate = 4_000;
    assert_config_error(&config, "sample_rate");

    config.playout.sample_rate = 384_000;
    assert_config_error(&config, "sample_rate");
}

#[test]
fn test_channel_bounds() {
    let mut config = Config::default();
    config.playout.channels = 0;
    assert_config_error(&config, "channels");

    config.playout.channels = 9;
    assert_config_error(&config, "channels");
}

#[test]
fn test_zero_sizes_rejected() {
    let mut config = Config::default();
    config.playout.block_frames = 0;
    assert_config_error(&config, "block_frames");

    let mut config = Config::default();
    config.playout.ring_buffer_ms = 0;
    assert_config_error(&config, "ring_buffer_ms");

    let mut config = Config::default();
    config.playout.ring_buffer_ms = 10;
    config.playout.block_frames = 4096;
    assert_config_error(&config, "ring_buffer_ms");
}

#[test]
fn test_negative_and_nan_durations_rejected() {
    let mut config = Config::default();
    config.transitions.crossfade_duration = -1.0;
    assert_config_error(&config, "crossfade_duration");

    let mut config = Config::default();
    config.transitions.fade_duration = f64::NAN;
    assert_config_error(&config, "fade_duration");

    let mut config = Config::default();
    config.playout.lead_time_secs = -0.5;
    assert_config_error(&config, "lead_time_secs");

    let mut config = Config::default();
    config.playout.start_timeout_secs = 0.0;
    assert_config_error(&config, "start_timeout_secs");
}

#[test]
fn test_network_sink_rules() {
    let text = r#"
        [[outputs.network]]
        name = "a"
        host = ""
        port = 5004
    "#;
    assert_config_error(&Config::from_toml_str(text).unwrap(), "empty host");

    let text = r#"
        [[outputs.network]]
        name = "a"
        host = "10.0.0.1"
        port = 5004

        [[outputs.network]]
        name = "a"
        host = "10.0.0.2"
        port = 5005
    "#;
    assert_config_error(&Config::from_toml_str(text).unwrap(), "duplicate");

    let text = r#"
        [[outputs.network]]
        name = "soundcard"
        host = "10.0.0.1"
        port = 5004
    "#;
    assert_config_error(&Config::from_toml_str(text).unwrap(), "duplicate");
}

#[test]
fn test_web_port_zero_only_rejected_when_enabled() {
    let mut config = Config::default();
    config.web.port = 0;
    assert_config_error(&config, "web.port");

    config.web.enabled = false;
    config.validate().unwrap();
}

#[test]
fn test_backoff_ordering() {
    let mut config = Config::default();
    config.outputs.recovery.initial_backoff_ms = 5_000;
    config.outputs.recovery.max_backoff_ms = 1_000;
    assert_config_error(&config, "max_backoff_ms");
}

#[test]
fn test_from_file_reads_and_validates() {
    let file = write_config("[playout]\nsample_rate = 44100\n");
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.playout.sample_rate, 44_100);

    let bad = write_config("[playout]\nchannels = 12\n");
    assert!(Config::from_file(bad.path()).is_err());
}

#[test]
fn test_from_file_missing_is_config_error() {
    let err = Config::from_file(Path::new("/nonexistent/haze/config.toml")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_load_with_explicit_path() {
    let file = write_config("[web]\nport = 8181\n");
    let (config, source) = Config::load(Some(file.path())).unwrap();
    assert_eq!(config.web.port, 8181);
    assert_eq!(source.as_deref(), Some(file.path()));
}

#[test]
fn test_blank_env_value_is_ignored() {
    let location = resolve_config_path(None, Some("   "));
    assert!(!matches!(location, ConfigLocation::Explicit(_)));
}
