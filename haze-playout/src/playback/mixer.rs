//! Sample-level mixing
//!
//! The transition engine decides *which* frames to combine and at what point
//! of a transition they sit; this module does the arithmetic:
//! - per-frame gain envelopes for fade-out and crossfade
//! - summing two sources with complementary gains, clamped to `[-1, 1]`
//! - pause: exponential decay from the last output frame to silence
//! - resume: short fade-in of the program output after a pause
//!
//! Transition progress is counted in output frames, so a gain for frame `i`
//! depends only on `(elapsed + i) / duration`, independent of tick size.

use haze_common::FadeCurve;

/// Per-sample decay factor while paused (31/32)
const PAUSE_DECAY_FACTOR: f32 = 0.96875;

/// Below this magnitude a decaying sample snaps to zero
const PAUSE_DECAY_FLOOR: f32 = 0.0001778;

/// Output state of the mixer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerState {
    Playing,
    Paused,
}

/// Fade-in applied to the output after resuming from pause
#[derive(Debug, Clone)]
struct ResumeState {
    fade_frames: u64,
    curve: FadeCurve,
    frames_since_resume: u64,
}

/// Normalized transition position of frame `i` of a block
pub fn progress(elapsed: u64, i: usize, duration: u64) -> f32 {
    if duration == 0 {
        return 1.0;
    }
    ((elapsed + i as u64) as f64 / duration as f64) as f32
}

/// Multiply each frame of `buf` by `gain(frame_index)`
pub fn apply_gain(buf: &mut [f32], channels: usize, gain: impl Fn(usize) -> f32) {
    for (i, frame) in buf.chunks_exact_mut(channels).enumerate() {
        let g = gain(i);
        for s in frame {
            *s *= g;
        }
    }
}

/// Fade `buf` out along `curve`, starting `elapsed` frames into a fade of `duration`
pub fn fade_out(buf: &mut [f32], channels: usize, curve: FadeCurve, elapsed: u64, duration: u64) {
    apply_gain(buf, channels, |i| curve.fade_out(progress(elapsed, i, duration)));
}

/// Crossfade `outgoing` into `incoming`, writing the clamped sum to `out`
///
/// All three slices hold the same number of frames. `joined` is the fade
/// position at which the incoming track came in: the outgoing gain follows
/// the whole fade, the incoming one rises from zero over the frames left
/// after `joined`.
#[allow(clippy::too_many_arguments)]
pub fn crossfade(
    out: &mut [f32],
    outgoing: &[f32],
    incoming: &[f32],
    channels: usize,
    curve: FadeCurve,
    elapsed: u64,
    duration: u64,
    joined: u64,
) {
    let in_elapsed = elapsed.saturating_sub(joined);
    let in_duration = duration.saturating_sub(joined);

    let frames = out
        .chunks_exact_mut(channels)
        .zip(outgoing.chunks_exact(channels))
        .zip(incoming.chunks_exact(channels));

    for (i, ((dst, a), b)) in frames.enumerate() {
        let g_out = curve.fade_out(progress(elapsed, i, duration));
        let g_in = curve.fade_in(progress(in_elapsed, i, in_duration));
        for c in 0..channels {
            dst[c] = (a[c] * g_out + b[c] * g_in).clamp(-1.0, 1.0);
        }
    }
}

/// Clamp every sample to `[-1, 1]`
pub fn clamp(buf: &mut [f32]) {
    for s in buf {
        *s = s.clamp(-1.0, 1.0);
    }
}

/// Final output stage: pause decay, resume fade, clamping
#[derive(Debug)]
pub struct Mixer {
    channels: usize,
    state: MixerState,
    /// Last output frame, the starting point of the pause decay
    last_frame: Vec<f32>,
    resume_state: Option<ResumeState>,
    frames_mixed: u64,
}

impl Mixer {
    pub fn new(channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            state: MixerState::Playing,
            last_frame: vec![0.0; channels],
            resume_state: None,
            frames_mixed: 0,
        }
    }

    pub fn state(&self) -> MixerState {
        self.state
    }

    pub fn set_state(&mut self, state: MixerState) {
        self.state = state;
    }

    /// Fade the output in over `fade_frames` frames
    pub fn start_resume_fade(&mut self, fade_frames: u64, curve: FadeCurve) {
        self.resume_state = (fade_frames > 0).then_some(ResumeState {
            fade_frames,
            curve,
            frames_since_resume: 0,
        });
    }

    pub fn is_resume_fading(&self) -> bool {
        self.resume_state.is_some()
    }

    /// Total frames passed through `finish_block`
    pub fn frames_mixed(&self) -> u64 {
        self.frames_mixed
    }

    /// Apply the resume fade and clamping to a mixed block, and remember its
    /// last frame for a later pause
    pub fn finish_block(&mut self, out: &mut [f32]) {
        let ch = self.channels;

        if let Some(resume) = self.resume_state.as_mut() {
            let start = resume.frames_since_resume;
            let total = resume.fade_frames;
            let curve = resume.curve;
            apply_gain(out, ch, |i| curve.fade_in(progress(start, i, total)));
            resume.frames_since_resume += (out.len() / ch) as u64;
            if resume.frames_since_resume >= total {
                self.resume_state = None;
            }
        }

        clamp(out);

        if out.len() >= ch {
            self.last_frame
                .copy_from_slice(&out[out.len() / ch * ch - ch..out.len() / ch * ch]);
        }
        self.frames_mixed += (out.len() / ch) as u64;
    }

    /// Fill `out` with the decaying tail of the last output frame
    pub fn fill_pause(&mut self, out: &mut [f32]) {
        for frame in out.chunks_exact_mut(self.channels) {
            for (dst, last) in frame.iter_mut().zip(self.last_frame.iter_mut()) {
                *last *= PAUSE_DECAY_FACTOR;
                if last.abs() < PAUSE_DECAY_FLOOR {
                    *last = 0.0;
                }
                *dst = *last;
            }
        }
    }
}
