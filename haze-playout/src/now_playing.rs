//! Now-playing status file
//!
//! Rewritten on every track start with one `key=value` pair per line, for
//! external tools that only want to tail a file. The cover picture embedded
//! in the track, if any, goes to a separate file.

use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use haze_common::events::TrackInfo;

use crate::audio::CoverArt;
use crate::error::Result;

fn line(value: &str) -> String {
    value.replace('\n', " ")
}

pub fn render(track: &TrackInfo, at: DateTime<Utc>) -> String {
    let duration = track
        .duration_secs
        .map(|d| format!("{:.3}", d))
        .unwrap_or_default();
    format!(
        "title={}\nartist={}\nalbum={}\nyear={}\nplaylist={}\nfile={}\nduration={}\ntimestamp={}\n",
        line(&track.title),
        line(track.artist.as_deref().unwrap_or_default()),
        line(track.album.as_deref().unwrap_or_default()),
        track.year.as_deref().unwrap_or_default(),
        line(&track.playlist),
        track.path,
        duration,
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

fn replace(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Replace the file at `path` with the entry for `track`
pub fn write(path: &Path, track: &TrackInfo) -> Result<()> {
    replace(path, render(track, Utc::now()).as_bytes())
}

/// Replace the cover file with `art`, or remove it for a track without one
pub fn write_art(path: &Path, art: Option<&CoverArt>) -> Result<()> {
    match art {
        Some(art) => replace(path, &art.data),
        None => match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn track() -> TrackInfo {
        TrackInfo {
            id: "/music/a.mp3".into(),
            title: "Night Drive".into(),
            path: "/music/a.mp3".into(),
            playlist: "Evening".into(),
            index: 2,
            duration_secs: Some(183.5),
            artist: Some("The Lamps".into()),
            album: None,
            year: Some("1998".into()),
            has_art: false,
        }
    }

    #[test]
    fn test_render_lines() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let text = render(&track(), at);
        assert_eq!(
            text,
            "title=Night Drive\nartist=The Lamps\nalbum=\nyear=1998\nplaylist=Evening\nfile=/music/a.mp3\nduration=183.500\ntimestamp=2024-05-01T12:30:00Z\n"
        );
    }

    #[test]
    fn test_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("now_playing.txt");
        fs::write(&path, "stale").unwrap();

        write(&path, &track()).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("title=Night Drive\nartist=The Lamps\n"));
        assert!(!dir.path().join("now_playing.tmp").exists());
    }

    #[test]
    fn test_write_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("now_playing.txt");
        assert!(write(&path, &track()).is_err());
    }

    #[test]
    fn test_art_is_written_then_cleared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("now_playing_art.jpg");
        let art = CoverArt {
            media_type: "image/jpeg".into(),
            data: vec![0xff, 0xd8, 0xff],
        };

        write_art(&path, Some(&art)).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![0xff, 0xd8, 0xff]);

        write_art(&path, None).unwrap();
        assert!(!path.exists());
        // Clearing twice is fine
        write_art(&path, None).unwrap();
    }
}
