//! Decoder adapter
//!
//! A [`DecoderBackend`] turns a [`Track`] into a running [`PcmSource`] that
//! yields interleaved `f32` PCM at the output format. The production backend
//! is [`FfmpegDecoder`], which spawns an external `ffmpeg` process per track
//! and reads raw s16le from its stdout.
//!
//! Sources are driven from a session's decode thread (see
//! `playback::session`), never from the mix path, so blocking here only
//! stalls decode-ahead for that one track.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::header::{self, TrackTags};
use super::types::{s16le_to_f32, PcmFormat};
use crate::error::{Error, Result};
use crate::playlist::Track;

/// Frames read from the decoder process per pipe read
pub const CHUNK_FRAMES: usize = 4096;

/// Stderr lines kept for failure reports
const STDERR_TAIL_LINES: usize = 8;

/// How long to wait for the exit status once stdout closed
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Result of one pull from a source
#[derive(Debug, Clone, PartialEq)]
pub enum Pull {
    /// Interleaved samples, always a whole number of frames
    Frames(Vec<f32>),
    /// The decoder finished cleanly; no more audio will follow
    EndOfStream,
}

/// A running decoder producing PCM for one track
pub trait PcmSource: Send {
    /// Pull up to `max_frames` frames
    ///
    /// May block up to the backend's read timeout. Errors are decode
    /// failures; the session stops pulling after the first one.
    fn pull(&mut self, max_frames: usize) -> Result<Pull>;

    /// Expected total length in output frames, when known
    fn estimated_frames(&self) -> Option<u64>;

    /// Tags embedded in the file, read before the first pull
    fn tags(&self) -> Option<Arc<TrackTags>> {
        None
    }

    /// Terminate the decoder, giving it `grace` to exit before killing it
    fn stop(&mut self, grace: Duration);
}

/// Factory for decoder sources
pub trait DecoderBackend: Send + Sync {
    /// Spawn a decoder for `track` producing PCM in `format`
    fn start(&self, track: &Track, format: PcmFormat) -> Result<Box<dyn PcmSource>>;
}

/// Decoder backend running one `ffmpeg` process per track
#[derive(Debug, Clone)]
pub struct FfmpegDecoder {
    ffmpeg_path: String,
    read_timeout: Duration,
}

impl FfmpegDecoder {
    pub fn new(ffmpeg_path: impl Into<String>, read_timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            read_timeout,
        }
    }

    fn command(&self, track: &Track, format: PcmFormat) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-nostdin")
            .args(["-hide_banner", "-loglevel", "error"])
            .arg("-i")
            .arg(&track.path)
            .args(["-vn", "-f", "s16le", "-acodec", "pcm_s16le"])
            .args(["-ar", &format.sample_rate.to_string()])
            .args(["-ac", &format.channels.to_string()])
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl DecoderBackend for FfmpegDecoder {
    fn start(&self, track: &Track, format: PcmFormat) -> Result<Box<dyn PcmSource>> {
        if !track.path.is_file() {
            return Err(Error::Decode(format!("file not found: {}", track.path.display())));
        }

        let header = header::read(&track.path).unwrap_or_default();
        let estimate = track
            .duration
            .or(header.duration_secs)
            .map(|secs| format.secs_to_frames(secs));
        let tags = (!header.tags.is_empty()).then(|| Arc::new(header.tags));

        let mut child = self.command(track, format).spawn().map_err(|e| {
            Error::Decode(format!("failed to spawn {}: {}", self.ffmpeg_path, e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Decode("decoder stdout unavailable".to_string()))?;
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_reader(stderr, Arc::clone(&stderr_tail), track.id.clone());
        }

        let (tx, rx) = mpsc::sync_channel(4);
        spawn_stdout_reader(stdout, tx, format.s16_frame_bytes() * CHUNK_FRAMES, &track.id)?;

        debug!(
            "Spawned decoder pid={} for {} (estimate {:?} frames)",
            child.id(),
            track.id,
            estimate
        );

        Ok(Box::new(FfmpegSource {
            child,
            rx: Some(rx),
            pending: Vec::new(),
            stderr_tail,
            format,
            estimate,
            tags,
            read_timeout: self.read_timeout,
            produced_audio: false,
            eof: false,
            finished: false,
        }))
    }
}

enum ReaderMsg {
    Data(Vec<u8>),
    Eof,
    Failed(std::io::Error),
}

fn spawn_stdout_reader(
    mut stdout: ChildStdout,
    tx: SyncSender<ReaderMsg>,
    chunk_bytes: usize,
    track_id: &str,
) -> Result<()> {
    thread::Builder::new()
        .name("haze-decode-pipe".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; chunk_bytes];
            loop {
                let msg = match stdout.read(&mut buf) {
                    Ok(0) => ReaderMsg::Eof,
                    Ok(n) => ReaderMsg::Data(buf[..n].to_vec()),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => ReaderMsg::Failed(e),
                };
                let last = !matches!(msg, ReaderMsg::Data(_));
                // A dropped receiver closes stdout, which ends the process with EPIPE
                if tx.send(msg).is_err() || last {
                    break;
                }
            }
        })
        .map_err(|e| Error::Decode(format!("failed to start pipe reader for {}: {}", track_id, e)))?;
    Ok(())
}

fn spawn_stderr_reader(stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>, track_id: String) {
    let spawned = thread::Builder::new()
        .name("haze-decode-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                debug!("ffmpeg [{}]: {}", track_id, line);
                let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start decoder stderr reader: {}", e);
    }
}

struct FfmpegSource {
    child: Child,
    rx: Option<Receiver<ReaderMsg>>,
    /// Bytes received but not yet handed out (partial frames, oversized chunks)
    pending: Vec<u8>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    format: PcmFormat,
    estimate: Option<u64>,
    tags: Option<Arc<TrackTags>>,
    read_timeout: Duration,
    produced_audio: bool,
    eof: bool,
    finished: bool,
}

impl FfmpegSource {
    fn stderr_summary(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(|e| e.into_inner());
        if tail.is_empty() {
            "no diagnostics".to_string()
        } else {
            tail.iter().cloned().collect::<Vec<_>>().join(" | ")
        }
    }

    /// Stdout closed: decide between a clean end and a failure from the exit status
    fn finish(&mut self) -> Result<Pull> {
        if self.finished {
            return Ok(Pull::EndOfStream);
        }
        self.finished = true;

        match wait_with_deadline(&mut self.child, EXIT_WAIT) {
            Some(status) if status.success() => Ok(Pull::EndOfStream),
            Some(status) if !self.produced_audio => Err(Error::Decode(format!(
                "decoder exited with {} before producing audio: {}",
                status,
                self.stderr_summary()
            ))),
            Some(status) => {
                warn!(
                    "Decoder exited with {} after producing audio: {}",
                    status,
                    self.stderr_summary()
                );
                Ok(Pull::EndOfStream)
            }
            None => {
                debug!("Decoder closed stdout but has not exited, stopping it");
                kill_and_reap(&mut self.child);
                Ok(Pull::EndOfStream)
            }
        }
    }
}

impl PcmSource for FfmpegSource {
    fn pull(&mut self, max_frames: usize) -> Result<Pull> {
        let frame_bytes = self.format.s16_frame_bytes();
        let max_frames = max_frames.max(1);

        loop {
            let whole = self.pending.len() / frame_bytes;
            if whole > 0 {
                let n = whole.min(max_frames) * frame_bytes;
                let samples = s16le_to_f32(&self.pending[..n]);
                self.pending.drain(..n);
                self.produced_audio = true;
                return Ok(Pull::Frames(samples));
            }

            if self.eof {
                return self.finish();
            }

            let Some(rx) = self.rx.as_ref() else {
                return Err(Error::Decode("decoder already stopped".to_string()));
            };

            match rx.recv_timeout(self.read_timeout) {
                Ok(ReaderMsg::Data(bytes)) => self.pending.extend_from_slice(&bytes),
                Ok(ReaderMsg::Eof) | Err(RecvTimeoutError::Disconnected) => self.eof = true,
                Ok(ReaderMsg::Failed(e)) => {
                    return Err(Error::Decode(format!("reading decoder output failed: {}", e)))
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::Decode(format!(
                        "decoder stalled: no output for {:.1}s",
                        self.read_timeout.as_secs_f64()
                    )))
                }
            }
        }
    }

    fn estimated_frames(&self) -> Option<u64> {
        self.estimate
    }

    fn tags(&self) -> Option<Arc<TrackTags>> {
        self.tags.clone()
    }

    fn stop(&mut self, grace: Duration) {
        // Closing our end of the pipe makes ffmpeg exit on its next write
        self.rx = None;
        if wait_with_deadline(&mut self.child, grace).is_none() {
            debug!("Decoder pid={} ignored stop for {:?}, killing", self.child.id(), grace);
            kill_and_reap(&mut self.child);
        }
        self.finished = true;
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            kill_and_reap(&mut self.child);
        }
    }
}

/// Poll for exit until `deadline` passes
pub(crate) fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to query process status: {}", e);
                return None;
            }
        }
    }
}

pub(crate) fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Kill of pid={} failed: {}", child.id(), e);
    }
    let _ = child.wait();
}
