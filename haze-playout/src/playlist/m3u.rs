//! M3U / M3U8 playlist parsing
//!
//! Supported lines:
//! - `#EXTINF:<seconds>,<title>` describes the next entry
//! - `#HAZE-TRANSITION:<kind> [seconds]` sets the transition out of the next entry
//! - `#HAZE-PLAYLIST-TRANSITION:<kind> [seconds]` sets the playlist default
//! - any other `#` line is ignored
//!
//! Relative paths resolve against the playlist file's directory. Entries
//! whose file does not exist are skipped.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Playlist, Track, TransitionOverride};
use crate::error::{Error, Result};

pub fn parse_file(path: &Path, name: &str) -> Result<Playlist> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Playlist(format!("failed to read {}: {}", path.display(), e)))?;
    let text = String::from_utf8_lossy(&bytes);
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(parse_str(&text, base, name))
}

pub fn parse_str(text: &str, base: &Path, name: &str) -> Playlist {
    let mut tracks = Vec::new();
    let mut playlist_transition = None;

    let mut title: Option<String> = None;
    let mut duration: Option<f64> = None;
    let mut transition: Option<TransitionOverride> = None;

    for raw in text.lines() {
        let line = raw.trim().trim_start_matches('\u{feff}');
        if line.is_empty() || line.starts_with("#EXTM3U") {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let (dur, name) = match rest.split_once(',') {
                Some((d, t)) => (d, Some(t.trim())),
                None => (rest, None),
            };
            duration = dur
                .split_whitespace()
                .next()
                .and_then(|d| d.parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d > 0.0);
            title = name.filter(|t| !t.is_empty()).map(str::to_string);
            continue;
        }

        if let Some(rest) = line.strip_prefix("#HAZE-PLAYLIST-TRANSITION:") {
            playlist_transition = TransitionOverride::parse(rest);
            continue;
        }

        if let Some(rest) = line.strip_prefix("#HAZE-TRANSITION:") {
            transition = TransitionOverride::parse(rest);
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let path = resolve_entry(line, base);
        if path.is_file() {
            let mut track = Track::new(path);
            track.title = title.take();
            track.duration = duration.take();
            track.transition = transition.take();
            tracks.push(track);
        } else {
            debug!("M3U entry {} not found, skipping", path.display());
        }

        title = None;
        duration = None;
        transition = None;
    }

    let mut playlist = Playlist::new(name, tracks);
    playlist.transition = playlist_transition;
    playlist
}

fn resolve_entry(entry: &str, base: &Path) -> PathBuf {
    let entry = entry
        .strip_prefix("file://")
        .map(|rest| urlencoding::decode(rest).map(|s| s.into_owned()).unwrap_or_else(|_| rest.to_string()))
        .unwrap_or_else(|| entry.to_string());
    let path = PathBuf::from(entry);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
