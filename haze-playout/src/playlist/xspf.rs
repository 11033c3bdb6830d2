//! XSPF playlist parsing
//!
//! Reads `trackList/track` elements in the `http://xspf.org/ns/0/` namespace:
//! `location` (plain path or `file://` URL, percent-decoded), `title`, and
//! `duration` in milliseconds. A `<meta rel="haze:transition">` element on a
//! track or on the playlist sets a transition override.

use std::path::{Path, PathBuf};

use roxmltree::{Document, Node};
use tracing::debug;

use super::{Playlist, Track, TransitionOverride};
use crate::error::{Error, Result};

const XSPF_NS: &str = "http://xspf.org/ns/0/";
const TRANSITION_META: &str = "haze:transition";

pub fn parse_file(path: &Path, name: &str) -> Result<Playlist> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Playlist(format!("failed to read {}: {}", path.display(), e)))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_str(&text, base, name)
}

pub fn parse_str(text: &str, base: &Path, name: &str) -> Result<Playlist> {
    let doc = Document::parse(text).map_err(|e| Error::Playlist(format!("invalid XSPF: {}", e)))?;
    let root = doc.root_element();
    if !root.has_tag_name((XSPF_NS, "playlist")) {
        return Err(Error::Playlist("root element is not an XSPF playlist".to_string()));
    }

    let mut tracks = Vec::new();
    for node in root.descendants().filter(|n| n.has_tag_name((XSPF_NS, "track"))) {
        let Some(location) = child_text(node, "location") else {
            continue;
        };

        let path = resolve_location(location, base);
        if !path.is_file() {
            debug!("XSPF entry {} not found, skipping", path.display());
            continue;
        }

        let mut track = Track::new(path);
        track.title = child_text(node, "title").map(str::to_string);
        track.duration = child_text(node, "duration")
            .and_then(|ms| ms.parse::<f64>().ok())
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| ms / 1000.0);
        track.transition = transition_meta(node);
        tracks.push(track);
    }

    let mut playlist = Playlist::new(name, tracks);
    playlist.transition = transition_meta(root);
    Ok(playlist)
}

fn child_text<'a>(node: Node<'a, '_>, tag: &str) -> Option<&'a str> {
    node.children()
        .find(|c| c.has_tag_name((XSPF_NS, tag)))
        .and_then(|c| c.text())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn transition_meta(node: Node<'_, '_>) -> Option<TransitionOverride> {
    node.children()
        .filter(|c| c.has_tag_name((XSPF_NS, "meta")))
        .find(|c| c.attribute("rel") == Some(TRANSITION_META))
        .and_then(|c| c.text())
        .and_then(TransitionOverride::parse)
}

fn resolve_location(location: &str, base: &Path) -> PathBuf {
    let stripped = location
        .strip_prefix("file://localhost")
        .or_else(|| location.strip_prefix("file://"))
        .unwrap_or(location);
    let decoded = urlencoding::decode(stripped)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| stripped.to_string());
    let path = PathBuf::from(decoded);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
