//! Synthetic decoder backend
//!
//! Tracks are looked up by file stem. Each clip yields a constant sample
//! value, so the program output shows exactly which track (or mix of
//! tracks) produced every frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use haze_playout::audio::{DecoderBackend, PcmFormat, PcmSource, Pull, TrackTags};
use haze_playout::error::{Error, Result};
use haze_playout::playlist::Track;

/// Holds a decoder back until the test opens it
#[derive(Debug, Clone, Default)]
pub struct Gate(Arc<AtomicBool>);

impl Gate {
    pub fn open(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn wait(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !self.0.load(Ordering::Acquire) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

#[derive(Debug, Clone)]
pub enum Clip {
    /// `frames` frames of `value`, with an exact length estimate
    Tone { frames: usize, value: f32 },
    /// Like `Tone`, but the decoder reports no length
    Unsized { frames: usize, value: f32 },
    /// Like `Tone`, but the first pull waits for `gate`
    Gated { frames: usize, value: f32, gate: Gate },
    /// The decoder refuses to start
    Broken,
    /// Starts, then never produces audio
    Silent,
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    clips: HashMap<String, Clip>,
    fallback: Option<Clip>,
    tags: HashMap<String, Arc<TrackTags>>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stem: &str, clip: Clip) -> Self {
        self.clips.insert(stem.to_string(), clip);
        self
    }

    /// Tags reported by the decoder for `stem`
    pub fn tagged(mut self, stem: &str, tags: TrackTags) -> Self {
        self.tags.insert(stem.to_string(), Arc::new(tags));
        self
    }

    /// Clip used for tracks without their own entry
    pub fn otherwise(mut self, clip: Clip) -> Self {
        self.fallback = Some(clip);
        self
    }
}

impl DecoderBackend for SyntheticBackend {
    fn start(&self, track: &Track, format: PcmFormat) -> Result<Box<dyn PcmSource>> {
        let stem = track
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let clip = self
            .clips
            .get(&stem)
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| Error::Decode(format!("no synthetic clip for {}", stem)))?;
        let tags = self.tags.get(&stem).cloned();

        match clip {
            Clip::Tone { frames, value } => Ok(Box::new(ToneSource {
                left: frames,
                total: Some(frames as u64),
                value,
                channels: format.channels(),
                gate: None,
                tags: tags.clone(),
            })),
            Clip::Unsized { frames, value } => Ok(Box::new(ToneSource {
                left: frames,
                total: None,
                value,
                channels: format.channels(),
                gate: None,
                tags: tags.clone(),
            })),
            Clip::Gated { frames, value, gate } => Ok(Box::new(ToneSource {
                left: frames,
                total: Some(frames as u64),
                value,
                channels: format.channels(),
                gate: Some(gate),
                tags,
            })),
            Clip::Broken => Err(Error::Decode(format!("{}: invalid data found", stem))),
            Clip::Silent => Ok(Box::new(SilentSource)),
        }
    }
}

struct ToneSource {
    left: usize,
    total: Option<u64>,
    value: f32,
    channels: usize,
    gate: Option<Gate>,
    tags: Option<Arc<TrackTags>>,
}

impl PcmSource for ToneSource {
    fn pull(&mut self, max_frames: usize) -> Result<Pull> {
        if let Some(gate) = self.gate.take() {
            gate.wait();
        }
        if self.left == 0 {
            return Ok(Pull::EndOfStream);
        }
        let n = self.left.min(max_frames);
        self.left -= n;
        Ok(Pull::Frames(vec![self.value; n * self.channels]))
    }

    fn estimated_frames(&self) -> Option<u64> {
        self.total
    }

    fn tags(&self) -> Option<Arc<TrackTags>> {
        self.tags.clone()
    }

    fn stop(&mut self, _grace: Duration) {}
}

struct SilentSource;

impl PcmSource for SilentSource {
    fn pull(&mut self, _max_frames: usize) -> Result<Pull> {
        thread::sleep(Duration::from_millis(5));
        Ok(Pull::Frames(Vec::new()))
    }

    fn estimated_frames(&self) -> Option<u64> {
        None
    }

    fn stop(&mut self, _grace: Duration) {}
}
