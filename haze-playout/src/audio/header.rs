//! Container header reading using symphonia
//!
//! Reads a track's declared length and its embedded tags (ID3, Vorbis
//! comments, MP4 atoms, RIFF INFO) without decoding any audio. The length
//! lets the transition engine schedule the next track before the decoder
//! finishes; the tags feed the now-playing outputs.

use std::path::Path;

use haze_common::events::TrackInfo;
use symphonia::core::codecs::CODEC_TYPE_NULL;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{
    Limit, MetadataOptions, MetadataRevision, StandardTagKey, StandardVisualKey, Value,
};
use symphonia::core::probe::Hint;
use tracing::debug;

/// Largest embedded picture kept in memory
const MAX_ART_BYTES: usize = 8 * 1024 * 1024;

/// Embedded cover picture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverArt {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Descriptive tags embedded in a media file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// First four characters of the recording date
    pub year: Option<String>,
    pub art: Option<CoverArt>,
}

impl TrackTags {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.year.is_none()
            && self.art.is_none()
    }

    /// Overlay the tags on a playlist entry; an embedded title wins over the
    /// playlist's own
    pub fn apply(&self, info: &mut TrackInfo) {
        if let Some(title) = &self.title {
            info.title = title.clone();
        }
        info.artist = self.artist.clone();
        info.album = self.album.clone();
        info.year = self.year.clone();
        info.has_art = self.art.is_some();
    }

    fn absorb(&mut self, rev: &MetadataRevision) {
        for tag in rev.tags() {
            let slot = match tag.std_key {
                Some(StandardTagKey::TrackTitle) => &mut self.title,
                Some(StandardTagKey::Artist) => &mut self.artist,
                Some(StandardTagKey::Album) => &mut self.album,
                Some(StandardTagKey::Date) | Some(StandardTagKey::ReleaseDate) => &mut self.year,
                Some(_) => continue,
                // Readers that leave the key unmapped
                None => match tag.key.trim().to_ascii_lowercase().as_str() {
                    "title" => &mut self.title,
                    "artist" => &mut self.artist,
                    "album" => &mut self.album,
                    "date" | "year" => &mut self.year,
                    _ => continue,
                },
            };
            if slot.is_none() {
                *slot = value_text(&tag.value);
            }
        }
        if let Some(year) = self.year.as_mut() {
            *year = year.chars().take(4).collect();
        }

        if self.art.is_none() {
            let visuals = rev.visuals();
            let chosen = visuals
                .iter()
                .find(|v| v.usage == Some(StandardVisualKey::FrontCover))
                .or_else(|| visuals.first());
            if let Some(visual) = chosen.filter(|v| !v.data.is_empty()) {
                let media_type = if visual.media_type.is_empty() {
                    "image/jpeg".to_string()
                } else {
                    visual.media_type.clone()
                };
                self.art = Some(CoverArt {
                    media_type,
                    data: visual.data.to_vec(),
                });
            }
        }
    }
}

/// What the container header told us
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub duration_secs: Option<f64>,
    pub tags: TrackTags,
}

/// Read length and tags from the container header
///
/// Returns `None` when the file cannot be opened or no format reader
/// recognizes it.
pub fn read(path: &Path) -> Option<Header> {
    let file = std::fs::File::open(path).ok()?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let meta_opts = MetadataOptions {
        limit_visual_bytes: Limit::Maximum(MAX_ART_BYTES),
        ..Default::default()
    };

    let mut opened = match symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &meta_opts,
    ) {
        Ok(opened) => opened,
        Err(e) => {
            debug!("Could not read header of {}: {}", path.display(), e);
            return None;
        }
    };

    let mut tags = TrackTags::default();
    // Tags found ahead of the container (ID3v2 on MP3) come first
    if let Some(mut metadata) = opened.metadata.get() {
        if let Some(rev) = metadata.skip_to_latest() {
            tags.absorb(rev);
        }
    }
    if let Some(rev) = opened.format.metadata().skip_to_latest() {
        tags.absorb(rev);
    }

    let duration_secs = opened
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .and_then(|track| {
            let params = &track.codec_params;
            let n_frames = params.n_frames?;
            if let Some(time_base) = params.time_base {
                let time = time_base.calc_time(n_frames);
                return Some(time.seconds as f64 + time.frac);
            }
            Some(n_frames as f64 / params.sample_rate? as f64)
        });

    debug!(
        "Header of {}: duration {:?}, title {:?}, artist {:?}",
        path.display(),
        duration_secs,
        tags.title,
        tags.artist
    );
    Some(Header {
        duration_secs,
        tags,
    })
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = text.trim_matches(|c: char| c.is_whitespace() || c == '\0');
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mono 16-bit WAV at 8 kHz with an optional RIFF INFO list ahead of the data
    fn wav(frames: usize, info: &[(&[u8; 4], &str)]) -> Vec<u8> {
        let mut fmt = Vec::new();
        fmt.extend_from_slice(&1u16.to_le_bytes());
        fmt.extend_from_slice(&1u16.to_le_bytes());
        fmt.extend_from_slice(&8000u32.to_le_bytes());
        fmt.extend_from_slice(&16000u32.to_le_bytes());
        fmt.extend_from_slice(&2u16.to_le_bytes());
        fmt.extend_from_slice(&16u16.to_le_bytes());

        let mut body = b"WAVE".to_vec();
        push_chunk(&mut body, b"fmt ", &fmt);
        if !info.is_empty() {
            let mut list = b"INFO".to_vec();
            for (id, text) in info {
                let mut value = text.as_bytes().to_vec();
                value.push(0);
                if value.len() % 2 == 1 {
                    value.push(0);
                }
                push_chunk(&mut list, id, &value);
            }
            push_chunk(&mut body, b"LIST", &list);
        }
        push_chunk(&mut body, b"data", &vec![0u8; frames * 2]);

        let mut file = Vec::new();
        push_chunk(&mut file, b"RIFF", &body);
        file
    }

    fn push_chunk(out: &mut Vec<u8>, id: &[u8; 4], payload: &[u8]) {
        out.extend_from_slice(id);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn write(name: &str, bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    #[test]
    fn test_missing_file_has_no_header() {
        assert_eq!(read(Path::new("/nonexistent/track.flac")), None);
    }

    #[test]
    fn test_garbage_file_has_no_header() {
        let (_dir, path) = write("noise.mp3", &[0u8; 64]);
        assert_eq!(read(&path), None);
    }

    #[test]
    fn test_untagged_wav_has_length_but_no_tags() {
        let (_dir, path) = write("plain.wav", &wav(16_000, &[]));
        let header = read(&path).unwrap();
        let secs = header.duration_secs.unwrap();
        assert!((secs - 2.0).abs() < 1e-6, "{}", secs);
        assert!(header.tags.is_empty());
    }

    #[test]
    fn test_riff_info_tags_are_read() {
        let bytes = wav(
            800,
            &[
                (b"INAM", "Night Drive"),
                (b"IART", "The Lamps"),
                (b"IPRD", "After Hours"),
                (b"ICRD", "1998-04-02"),
            ],
        );
        let (_dir, path) = write("tagged.wav", &bytes);
        let tags = read(&path).unwrap().tags;
        assert_eq!(tags.title.as_deref(), Some("Night Drive"));
        assert_eq!(tags.artist.as_deref(), Some("The Lamps"));
        assert_eq!(tags.album.as_deref(), Some("After Hours"));
        assert_eq!(tags.year.as_deref(), Some("1998"));
        assert_eq!(tags.art, None);
    }

    #[test]
    fn test_tags_overlay_track_info() {
        let mut info = TrackInfo {
            id: "/music/a.wav".into(),
            title: "a".into(),
            path: "/music/a.wav".into(),
            playlist: "Main".into(),
            index: 0,
            duration_secs: None,
            artist: None,
            album: None,
            year: None,
            has_art: false,
        };
        let tags = TrackTags {
            title: Some("Night Drive".into()),
            artist: Some("The Lamps".into()),
            art: Some(CoverArt {
                media_type: "image/png".into(),
                data: vec![1, 2, 3],
            }),
            ..Default::default()
        };
        tags.apply(&mut info);
        assert_eq!(info.title, "Night Drive");
        assert_eq!(info.artist.as_deref(), Some("The Lamps"));
        assert_eq!(info.album, None);
        assert!(info.has_art);

        // A tag set without a title keeps the playlist's
        TrackTags::default().apply(&mut info);
        assert_eq!(info.title, "Night Drive");
        assert_eq!(info.artist, None);
        assert!(!info.has_art);
    }
}
