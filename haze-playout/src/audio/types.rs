//! Core audio data types
//!
//! All PCM inside the engine is interleaved `f32` in `[-1.0, 1.0]` at the
//! configured output rate and channel count. Decoders and the network sink
//! exchange signed 16-bit little-endian with external processes; the
//! conversions live here.

use haze_common::config::secs_to_frames;

/// Output stream format shared by every stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels as usize
    }

    /// Interleaved sample count for `frames` frames
    pub fn samples(&self, frames: usize) -> usize {
        frames * self.channels as usize
    }

    pub fn frames_to_secs(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64
    }

    pub fn secs_to_frames(&self, secs: f64) -> u64 {
        secs_to_frames(secs, self.sample_rate)
    }

    /// Bytes per frame of s16le audio
    pub fn s16_frame_bytes(&self) -> usize {
        self.channels as usize * 2
    }
}

/// Convert s16le bytes to `f32` samples; a trailing odd byte is ignored
pub fn s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Convert `f32` samples to s16le bytes, clamping out-of-range input
pub fn f32_to_s16le(samples: &[f32], out: &mut Vec<u8>) {
    out.clear();
    out.reserve(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}
