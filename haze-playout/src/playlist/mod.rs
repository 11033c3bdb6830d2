//! Playlist model and discovery
//!
//! Playlists come from the playlists directory:
//! - audio files directly in the root form the playlist `Default`
//! - each subdirectory holding audio files forms a playlist named after it
//! - each `.m3u`, `.m3u8` or `.xspf` file forms a playlist named after its stem
//!
//! Discovery is synchronous and produces an immutable [`PlaylistSet`]; a
//! reload builds a fresh set and swaps it in whole.

pub mod m3u;
pub mod xspf;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use haze_common::events::{PlaylistSummary, TransitionKind};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// File extensions treated as playable audio
pub const AUDIO_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "wav", "aac", "ogg", "opus", "m4a", "wma", "aiff", "alac", "mp2", "ape", "wv",
    "tta", "ac3", "dts",
];

/// File extensions parsed as playlist files
pub const PLAYLIST_EXTENSIONS: &[&str] = &["m3u", "m3u8", "xspf"];

/// Name of the playlist built from audio files in the root directory
pub const DEFAULT_PLAYLIST_NAME: &str = "Default";

/// Transition requested by a track or playlist instead of the configured default
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionOverride {
    pub kind: TransitionKind,
    /// Seconds; the configured duration for `kind` when unset
    pub duration_secs: Option<f64>,
}

impl TransitionOverride {
    /// Parse `"<kind> [seconds]"`, e.g. `crossfade 3.5` or `cut`
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let kind = parts.next()?.parse::<TransitionKind>().ok()?;
        let duration_secs = match parts.next() {
            Some(raw) => Some(raw.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)?),
            None => None,
        };
        Some(Self {
            kind,
            duration_secs,
        })
    }
}

/// One playable entry
///
/// Identity is the canonical path, so the same file keeps its identity across
/// reloads and playlist switches.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: String,
    pub path: PathBuf,
    pub title: Option<String>,
    /// Declared length in seconds (from `#EXTINF` or XSPF `duration`)
    pub duration: Option<f64>,
    pub transition: Option<TransitionOverride>,
}

impl Track {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let path = std::fs::canonicalize(&path).unwrap_or(path);
        Self {
            id: path.to_string_lossy().into_owned(),
            path,
            title: None,
            duration: None,
            transition: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration = Some(secs);
        self
    }

    pub fn with_transition(mut self, transition: TransitionOverride) -> Self {
        self.transition = Some(transition);
        self
    }

    /// Title for display: the declared title, else the file stem
    pub fn display_title(&self) -> String {
        match &self.title {
            Some(title) if !title.trim().is_empty() => title.clone(),
            _ => self
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.id.clone()),
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_title())
    }
}

/// An ordered list of tracks
#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<Arc<Track>>,
    pub transition: Option<TransitionOverride>,
    /// Directory or playlist file this playlist was built from
    pub source: PathBuf,
}

impl Playlist {
    pub fn new(name: impl Into<String>, tracks: Vec<Track>) -> Self {
        Self {
            name: name.into(),
            tracks: tracks.into_iter().map(Arc::new).collect(),
            transition: None,
            source: PathBuf::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Index of the first track with the given identity
    pub fn position_of(&self, track_id: &str) -> Option<usize> {
        self.tracks.iter().position(|t| t.id == track_id)
    }

    pub fn summary(&self) -> PlaylistSummary {
        PlaylistSummary {
            name: self.name.clone(),
            tracks: self.tracks.len(),
            source: self.source.display().to_string(),
        }
    }
}

/// Immutable snapshot of every discovered playlist, in discovery order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaylistSet {
    playlists: Vec<Arc<Playlist>>,
}

impl PlaylistSet {
    /// Build a set; a later playlist with an already used name replaces the earlier one
    pub fn new(playlists: Vec<Playlist>) -> Self {
        let mut set = Self::default();
        for playlist in playlists {
            set.insert(playlist);
        }
        set
    }

    fn insert(&mut self, playlist: Playlist) {
        if let Some(existing) = self.playlists.iter_mut().find(|p| p.name == playlist.name) {
            warn!(
                "Playlist name '{}' used twice, keeping {}",
                playlist.name,
                playlist.source.display()
            );
            *existing = Arc::new(playlist);
        } else {
            self.playlists.push(Arc::new(playlist));
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Playlist>> {
        self.playlists.iter().find(|p| p.name == name).cloned()
    }

    pub fn first(&self) -> Option<Arc<Playlist>> {
        self.playlists.first().cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.playlists.iter().map(|p| p.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Playlist>> {
        self.playlists.iter()
    }

    pub fn len(&self) -> usize {
        self.playlists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.playlists.is_empty()
    }

    pub fn summaries(&self) -> Vec<PlaylistSummary> {
        self.playlists.iter().map(|p| p.summary()).collect()
    }
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

pub fn is_audio_file(path: &Path) -> bool {
    has_extension(path, AUDIO_EXTENSIONS)
}

pub fn is_playlist_file(path: &Path) -> bool {
    has_extension(path, PLAYLIST_EXTENSIONS)
}

/// Audio files directly inside `dir`, sorted by file name
fn scan_folder(dir: &Path) -> Result<Vec<Track>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_audio_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths.into_iter().map(Track::new).collect())
}

/// Read one playlist file, dispatching on its extension
pub fn parse_playlist_file(path: &Path) -> Result<Playlist> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Playlist(format!("{} has no file name", path.display())))?;

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let mut playlist = match ext.as_str() {
        "m3u" | "m3u8" => m3u::parse_file(path, &name)?,
        "xspf" => xspf::parse_file(path, &name)?,
        other => {
            return Err(Error::Playlist(format!(
                "unsupported playlist format '{}': {}",
                other,
                path.display()
            )))
        }
    };
    playlist.source = path.to_path_buf();
    Ok(playlist)
}

/// Scan `root` and build the playlist set
///
/// A missing root yields an empty set. Unreadable or malformed playlist
/// files are logged and skipped; empty playlists are left out.
pub fn discover(root: &Path) -> Result<PlaylistSet> {
    if !root.is_dir() {
        warn!("Playlists directory {} does not exist", root.display());
        return Ok(PlaylistSet::default());
    }

    let mut playlists = Vec::new();

    let root_tracks = scan_folder(root)?;
    if !root_tracks.is_empty() {
        let mut playlist = Playlist::new(DEFAULT_PLAYLIST_NAME, root_tracks);
        playlist.source = root.to_path_buf();
        playlists.push(playlist);
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(root)? {
        entries.push(entry?.path());
    }
    entries.sort();

    for path in entries {
        if path.is_dir() {
            let tracks = match scan_folder(&path) {
                Ok(tracks) => tracks,
                Err(e) => {
                    warn!("Skipping folder {}: {}", path.display(), e);
                    continue;
                }
            };
            if tracks.is_empty() {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mut playlist = Playlist::new(name, tracks);
            playlist.source = path;
            playlists.push(playlist);
        } else if path.is_file() && is_playlist_file(&path) {
            match parse_playlist_file(&path) {
                Ok(playlist) if playlist.is_empty() => {
                    debug!("Playlist {} has no playable tracks", path.display());
                }
                Ok(playlist) => playlists.push(playlist),
                Err(e) => warn!("Skipping playlist {}: {}", path.display(), e),
            }
        }
    }

    let set = PlaylistSet::new(playlists);
    info!(
        "Discovered {} playlist(s) in {}: {:?}",
        set.len(),
        root.display(),
        set.names()
    );
    Ok(set)
}
