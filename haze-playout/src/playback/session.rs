//! Decode sessions: one running decoder feeding one ring buffer
//!
//! A session owns the consumer half of its ring buffer; a dedicated decode
//! thread owns the producer half and the decoder source. Starting the
//! decoder (process spawn, header and tag reading) happens on that thread, so
//! `DecodeSession::start` returns immediately and never blocks the mixer.
//!
//! State is shared through atomics:
//!
//! ```text
//! Starting ──first audio──▶ Streaming ──decoder EOS──▶ Draining ──buffer empty──▶ Ended
//!    │                         │
//!    └──error / no audio──▶ Failed   (errors after audio truncate into Draining)
//! ```
//!
//! Dropping a session raises its stop flag; the decode thread then stops the
//! decoder with a grace period and exits on its own.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use uuid::Uuid;

use super::ring_buffer::{PcmConsumer, PcmProducer, PcmRingBuffer, ReadOutcome};
use crate::audio::{DecoderBackend, PcmFormat, Pull, TrackTags};
use crate::playlist::Track;

const UNKNOWN: u64 = u64::MAX;

/// Lifecycle of a decode session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Starting = 0,
    Streaming = 1,
    Draining = 2,
    Ended = 3,
    Failed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Starting,
            1 => SessionState::Streaming,
            2 => SessionState::Draining,
            3 => SessionState::Ended,
            _ => SessionState::Failed,
        }
    }
}

/// Readiness as seen by the transition engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionHealth {
    /// Still waiting for the first audio
    Pending,
    /// Has audio buffered or has finished decoding
    Ready,
    /// Failed to start, produced nothing, or missed the start timeout
    Failed(String),
}

/// Parameters for every session the engine starts
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub format: PcmFormat,
    pub capacity_frames: usize,
    /// Frames requested from the decoder per pull
    pub pull_frames: usize,
    pub start_timeout: Duration,
    /// Time a stopping decoder gets before it is killed
    pub grace: Duration,
}

struct SessionShared {
    state: AtomicU8,
    stop: AtomicBool,
    estimate: AtomicU64,
    decoded_frames: AtomicU64,
    error: Mutex<Option<String>>,
    tags: Mutex<Option<Arc<TrackTags>>>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn fail(&self, reason: String) {
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.set_state(SessionState::Failed);
    }
}

/// A track being decoded ahead of playback
pub struct DecodeSession {
    id: Uuid,
    track: Arc<Track>,
    consumer: PcmConsumer,
    shared: Arc<SessionShared>,
    started_at: Instant,
    start_timeout: Duration,
}

impl DecodeSession {
    /// Spawn the decode thread for `track` and return immediately
    pub fn start(
        backend: Arc<dyn DecoderBackend>,
        track: Arc<Track>,
        settings: &SessionSettings,
    ) -> Self {
        let id = Uuid::new_v4();
        let (producer, consumer) =
            PcmRingBuffer::new(settings.capacity_frames, settings.format.channels());
        let shared = Arc::new(SessionShared {
            state: AtomicU8::new(SessionState::Starting as u8),
            stop: AtomicBool::new(false),
            estimate: AtomicU64::new(UNKNOWN),
            decoded_frames: AtomicU64::new(0),
            error: Mutex::new(None),
            tags: Mutex::new(None),
        });

        let worker = DecodeWorker {
            backend,
            track: Arc::clone(&track),
            settings: settings.clone(),
            producer,
            shared: Arc::clone(&shared),
        };

        let name = format!("haze-decode-{}", &id.simple().to_string()[..8]);
        if let Err(e) = thread::Builder::new().name(name).spawn(move || worker.run()) {
            error!("Failed to spawn decode thread for {}: {}", track.id, e);
            shared.fail(format!("failed to spawn decode thread: {}", e));
        }

        debug!("Decode session {} started for {}", id, track.id);

        Self {
            id,
            track,
            consumer,
            shared,
            started_at: Instant::now(),
            start_timeout: settings.start_timeout,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn error(&self) -> Option<String> {
        self.shared
            .error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Embedded tags; known once the session is ready
    pub fn tags(&self) -> Option<Arc<TrackTags>> {
        self.shared
            .tags
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Readiness, applying the start timeout to sessions still starting
    pub fn health(&self) -> SessionHealth {
        match self.state() {
            SessionState::Failed => SessionHealth::Failed(
                self.error()
                    .unwrap_or_else(|| "decoder failed".to_string()),
            ),
            SessionState::Starting if self.started_at.elapsed() > self.start_timeout => {
                SessionHealth::Failed(format!(
                    "no audio within {:.1}s",
                    self.start_timeout.as_secs_f64()
                ))
            }
            SessionState::Starting => SessionHealth::Pending,
            _ => SessionHealth::Ready,
        }
    }

    /// Decoder has finished (cleanly, truncated, or failed)
    pub fn decoder_done(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Draining | SessionState::Ended | SessionState::Failed
        )
    }

    /// Finished decoding and every buffered frame has been read
    pub fn is_exhausted(&self) -> bool {
        self.consumer.is_exhausted()
    }

    pub fn available_frames(&self) -> usize {
        self.consumer.available_frames()
    }

    pub fn frames_consumed(&self) -> u64 {
        self.consumer.frames_read()
    }

    /// Expected total length in frames, from the decoder or the playlist entry
    pub fn estimated_frames(&self) -> Option<u64> {
        match self.shared.estimate.load(Ordering::Relaxed) {
            UNKNOWN => None,
            frames => Some(frames),
        }
    }

    /// Frames left to play
    ///
    /// Exact once the decoder has finished (whatever is still buffered);
    /// before that, the length estimate minus frames already consumed, but
    /// never less than what is buffered. `None` while the length is unknown.
    pub fn remaining_frames(&self) -> Option<u64> {
        let buffered = self.consumer.available_frames() as u64;
        if self.decoder_done() {
            return Some(buffered);
        }
        self.estimated_frames()
            .map(|total| total.saturating_sub(self.frames_consumed()).max(buffered))
    }

    /// Read frames for mixing; marks the session ended on end of stream
    pub fn read(&mut self, out: &mut [f32]) -> ReadOutcome {
        let outcome = self.consumer.read(out);
        if outcome == ReadOutcome::EndOfStream && self.state() == SessionState::Draining {
            self.shared.set_state(SessionState::Ended);
        }
        outcome
    }

    /// Ask the decode thread to stop; it reaps the decoder on its own
    pub fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("id", &self.id)
            .field("track", &self.track.id)
            .field("state", &self.state())
            .field("buffered", &self.available_frames())
            .finish()
    }
}

/// Everything the decode thread owns
struct DecodeWorker {
    backend: Arc<dyn DecoderBackend>,
    track: Arc<Track>,
    settings: SessionSettings,
    producer: PcmProducer,
    shared: Arc<SessionShared>,
}

impl DecodeWorker {
    fn run(mut self) {
        let mut source = match self.backend.start(&self.track, self.settings.format) {
            Ok(source) => source,
            Err(e) => {
                self.shared.fail(e.to_string());
                self.producer.finish();
                return;
            }
        };

        // Streams without a length in their headers fall back to the
        // playlist's declared duration
        let estimate = source.estimated_frames().or_else(|| {
            self.track
                .duration
                .map(|secs| self.settings.format.secs_to_frames(secs))
        });
        if let Some(frames) = estimate {
            self.shared.estimate.store(frames, Ordering::Relaxed);
        }
        *self.shared.tags.lock().unwrap_or_else(|e| e.into_inner()) = source.tags();

        let channels = self.settings.format.channels();
        let mut produced = false;

        while !self.shared.stop.load(Ordering::Acquire) {
            match source.pull(self.settings.pull_frames) {
                Ok(Pull::Frames(samples)) => {
                    let frames = samples.len() / channels;
                    if frames == 0 {
                        continue;
                    }
                    self.shared
                        .decoded_frames
                        .fetch_add(frames as u64, Ordering::Relaxed);

                    // Publish audio before announcing Streaming, without
                    // blocking: the consumer only starts reading once it sees
                    // the session ready.
                    let written = self.producer.write(&samples);
                    if !produced {
                        produced = true;
                        self.shared.set_state(SessionState::Streaming);
                    }
                    if !self
                        .producer
                        .write_all(&samples[written..], &self.shared.stop)
                    {
                        break;
                    }
                }
                Ok(Pull::EndOfStream) => {
                    if produced {
                        self.shared.set_state(SessionState::Draining);
                    } else {
                        self.shared
                            .fail("decoder produced no audio".to_string());
                    }
                    break;
                }
                Err(e) => {
                    if produced {
                        warn!(
                            track = %self.track.id,
                            "Decode failed mid-stream, playing what was decoded: {}", e
                        );
                        self.shared.set_state(SessionState::Draining);
                    } else {
                        self.shared.fail(e.to_string());
                    }
                    break;
                }
            }
        }

        self.producer.finish();
        source.stop(self.settings.grace);
        debug!(
            "Decode thread for {} exiting after {} frames",
            self.track.id,
            self.shared.decoded_frames.load(Ordering::Relaxed)
        );
    }
}
