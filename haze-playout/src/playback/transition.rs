//! Transition engine
//!
//! Drives the program output one block at a time. It owns the playout
//! controller and at most two decode sessions (current and next) and moves
//! between the states of [`TransitionState`]:
//!
//! ```text
//! Idle ─play─▶ PlayingSingle ─lead time─▶ PreparingNext ─boundary─▶ Transitioning
//!                   ▲                                                     │
//!                   └──────────────────── swap (commit) ──────────────────┘
//! ```
//!
//! Any state goes to `Stopped` on shutdown, or when too many consecutive
//! tracks fail to decode at one boundary.
//!
//! Rendering is segmented: a block may hold the tail of the single-track
//! phase followed by the first frames of a transition, so transitions start
//! and end on exact frames regardless of block size.
//!
//! A fade that falls due while the next track is still starting begins on
//! schedule. The next track then joins it late, rising from silence over
//! whatever is left of the fade, while the outgoing gain carries on.

use std::mem;
use std::sync::Arc;

use chrono::Utc;
use haze_common::config::TransitionsConfig;
use haze_common::events::{
    EnginePhase, PlaybackState, PlayoutEvent, PlayoutStatus, TrackInfo, TransitionInfo,
    TransitionKind,
};
use haze_common::{Config, FadeCurve};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::controller::{ControllerSettings, Cue, PlayoutController, SelectOutcome};
use super::mixer::{self, Mixer, MixerState};
use super::ring_buffer::ReadOutcome;
use super::session::{DecodeSession, SessionHealth, SessionSettings};
use crate::audio::{DecoderBackend, PcmFormat, TrackTags, CHUNK_FRAMES};
use crate::error::{Error, Result};
use crate::playlist::PlaylistSet;

/// Consecutive empty segments before the rest of a block is filled with silence
const MAX_STALLS: usize = 4;

/// Log every Nth underrun
const UNDERRUN_LOG_INTERVAL: u64 = 100;

/// How one track hands over to the next
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionPlan {
    pub kind: TransitionKind,
    pub duration_frames: u64,
    pub curve: FadeCurve,
    /// Manual skip; cuts as soon as the next track streams
    pub forced: bool,
}

impl TransitionPlan {
    pub fn forced_cut() -> Self {
        Self {
            kind: TransitionKind::Cut,
            duration_frames: 0,
            curve: FadeCurve::Linear,
            forced: true,
        }
    }

    fn cut() -> Self {
        Self {
            forced: false,
            ..Self::forced_cut()
        }
    }

    /// Work out the transition from `outgoing` into `incoming`
    ///
    /// The outgoing track's own override wins over its playlist's, which
    /// wins over the configured default. The duration is clamped to what is
    /// left of the outgoing track and, for crossfades, to the declared length
    /// of the incoming one. A zero-length fade degenerates to a cut.
    pub fn resolve(
        outgoing: &Cue,
        remaining_frames: Option<u64>,
        incoming: Option<&Cue>,
        config: &TransitionsConfig,
        format: PcmFormat,
    ) -> Self {
        let over = outgoing.track.transition.or(outgoing.playlist.transition);
        let kind = over.map(|o| o.kind).unwrap_or(config.default);
        if kind == TransitionKind::Cut {
            return Self::cut();
        }

        let secs = over
            .and_then(|o| o.duration_secs)
            .unwrap_or_else(|| config.duration_for(kind));
        let mut frames = format.secs_to_frames(secs);
        if let Some(remaining) = remaining_frames {
            frames = frames.min(remaining);
        }
        if kind == TransitionKind::Crossfade {
            if let Some(secs) = incoming.and_then(|cue| cue.track.duration) {
                frames = frames.min(format.secs_to_frames(secs));
            }
        }

        if frames == 0 {
            return Self::cut();
        }
        Self {
            kind,
            duration_frames: frames,
            curve: config.curve,
            forced: false,
        }
    }

    pub fn info(&self, format: PcmFormat) -> TransitionInfo {
        TransitionInfo {
            kind: self.kind,
            duration_secs: format.frames_to_secs(self.duration_frames),
            curve: self.curve,
            forced: self.forced,
        }
    }
}

/// What happens once the current track runs out with nothing prepared
#[derive(Debug, Clone, PartialEq)]
enum Tail {
    Continue,
    PlaylistEnd,
    Halt(String),
}

/// Closing fade of a track whose successor was not streaming in time
#[derive(Debug, Clone, Copy, PartialEq)]
struct Fade {
    elapsed: u64,
    duration: u64,
    curve: FadeCurve,
}

/// A cue with its running decode session
#[derive(Debug)]
pub struct ActiveTrack {
    pub cue: Cue,
    pub session: DecodeSession,
    /// Failed entries skipped at this boundary before this one
    attempts: usize,
    /// TrackStarted (or the start failure) has been reported
    start_reported: bool,
    tail: Tail,
    /// Fade started on schedule while the next track was still pending
    fade: Option<Fade>,
}

impl ActiveTrack {
    /// Playlist entry overlaid with the file's own tags, once read
    pub fn info(&self) -> TrackInfo {
        let mut info = self.cue.info();
        if let Some(tags) = self.session.tags() {
            tags.apply(&mut info);
        }
        info
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Shutdown,
    Exhausted { reason: String },
}

#[derive(Debug)]
pub enum TransitionState {
    Idle,
    PlayingSingle {
        current: ActiveTrack,
    },
    PreparingNext {
        current: ActiveTrack,
        next: ActiveTrack,
        plan: TransitionPlan,
    },
    Transitioning {
        current: ActiveTrack,
        next: ActiveTrack,
        plan: TransitionPlan,
        elapsed: u64,
        /// Fade position at which the incoming track came in
        joined: u64,
    },
    Stopped {
        reason: StopReason,
    },
}

impl TransitionState {
    pub fn phase(&self) -> EnginePhase {
        match self {
            TransitionState::Idle => EnginePhase::Idle,
            TransitionState::PlayingSingle { .. } => EnginePhase::PlayingSingle,
            TransitionState::PreparingNext { .. } => EnginePhase::PreparingNext,
            TransitionState::Transitioning { .. } => EnginePhase::Transitioning,
            TransitionState::Stopped { .. } => EnginePhase::Stopped,
        }
    }

    fn is_active(&self) -> bool {
        !matches!(
            self,
            TransitionState::Idle | TransitionState::Stopped { .. }
        )
    }
}

/// Engine counters, reported in the status snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    /// Frames of track audio output (silence excluded)
    pub audio_frames: u64,
    /// Frames of silence inserted because a track had no audio ready
    pub underrun_frames: u64,
    pub transitions: u64,
    pub decode_failures: u64,
}

/// Everything the engine needs besides the decoder backend
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub format: PcmFormat,
    pub session: SessionSettings,
    pub lead_time_frames: u64,
    pub max_skips_per_boundary: usize,
    pub resume_fade_frames: u64,
    pub transitions: TransitionsConfig,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        let playout = &config.playout;
        let format = PcmFormat::new(playout.sample_rate, playout.channels);
        Self {
            format,
            session: SessionSettings {
                format,
                capacity_frames: playout.ring_buffer_frames(),
                pull_frames: CHUNK_FRAMES,
                start_timeout: playout.start_timeout(),
                grace: playout.decoder_grace(),
            },
            lead_time_frames: playout.lead_time_frames(),
            max_skips_per_boundary: playout.max_skips_per_boundary.max(1),
            resume_fade_frames: playout.resume_fade_frames(),
            transitions: config.transitions.clone(),
        }
    }
}

enum Segment {
    /// `n` frames of track audio were written
    Audio(usize),
    /// Nothing should play; the rest of the block is silence
    Silence,
    /// Audio is expected but none is available right now
    Stall,
}

pub struct TransitionEngine {
    backend: Arc<dyn DecoderBackend>,
    settings: EngineSettings,
    controller: PlayoutController,
    state: TransitionState,
    mixer: Mixer,
    cur_buf: Vec<f32>,
    next_buf: Vec<f32>,
    counters: EngineCounters,
    underrun_events: u64,
    events: Vec<PlayoutEvent>,
}

impl TransitionEngine {
    pub fn new(
        backend: Arc<dyn DecoderBackend>,
        settings: EngineSettings,
        controller: PlayoutController,
    ) -> Self {
        let mixer = Mixer::new(settings.format.channels());
        Self {
            backend,
            settings,
            controller,
            state: TransitionState::Idle,
            mixer,
            cur_buf: Vec::new(),
            next_buf: Vec::new(),
            counters: EngineCounters::default(),
            underrun_events: 0,
            events: Vec::new(),
        }
    }

    /// Build an engine over `set` from the process configuration
    pub fn from_config(
        backend: Arc<dyn DecoderBackend>,
        config: &Config,
        set: Arc<PlaylistSet>,
    ) -> Self {
        let mut controller =
            PlayoutController::new(set, ControllerSettings::from_config(config));
        controller.activate_default(config.playout.default_playlist.as_deref());
        Self::new(backend, EngineSettings::from_config(config), controller)
    }

    pub fn format(&self) -> PcmFormat {
        self.settings.format
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }

    pub fn phase(&self) -> EnginePhase {
        self.state.phase()
    }

    pub fn controller(&self) -> &PlayoutController {
        &self.controller
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    pub fn is_paused(&self) -> bool {
        self.mixer.state() == MixerState::Paused
    }

    /// Events produced since the last call
    pub fn drain_events(&mut self) -> Vec<PlayoutEvent> {
        mem::take(&mut self.events)
    }

    /// Every live session has at least `frames` buffered, has finished, or
    /// has failed
    pub fn is_primed(&self, frames: usize) -> bool {
        let primed = |track: &ActiveTrack| match track.session.health() {
            SessionHealth::Pending => false,
            SessionHealth::Failed(_) => true,
            SessionHealth::Ready => {
                track.session.decoder_done() || track.session.available_frames() >= frames
            }
        };
        match &self.state {
            TransitionState::PlayingSingle { current } => primed(current),
            TransitionState::PreparingNext { current, next, .. }
            | TransitionState::Transitioning { current, next, .. } => {
                primed(current) && primed(next)
            }
            _ => true,
        }
    }

    /// Tags of the live track decoded by `session`
    pub fn session_tags(&self, session: Uuid) -> Option<Arc<TrackTags>> {
        let tracks = match &self.state {
            TransitionState::PlayingSingle { current } => vec![current],
            TransitionState::PreparingNext { current, next, .. }
            | TransitionState::Transitioning { current, next, .. } => vec![current, next],
            _ => Vec::new(),
        };
        tracks
            .into_iter()
            .find(|t| t.session.id() == session)
            .and_then(|t| t.session.tags())
    }

    /// Status snapshot; sink entries are left for the caller
    pub fn status(&self) -> PlayoutStatus {
        let format = self.settings.format;
        let (current, next, transition) = match &self.state {
            TransitionState::PlayingSingle { current } => (Some(current), None, None),
            TransitionState::PreparingNext {
                current,
                next,
                plan,
            }
            | TransitionState::Transitioning {
                current,
                next,
                plan,
                ..
            } => (Some(current), Some(next), Some(plan.info(format))),
            _ => (None, None, None),
        };
        let halted_reason = match &self.state {
            TransitionState::Stopped {
                reason: StopReason::Exhausted { reason },
            } => Some(reason.clone()),
            _ => None,
        };
        let state = if !self.state.is_active() {
            PlaybackState::Stopped
        } else if self.is_paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };

        PlayoutStatus {
            state,
            phase: self.state.phase(),
            playlist: self.controller.active_playlist().map(|p| p.name.clone()),
            pending_playlist: self.controller.pending_playlist().map(|p| p.name.clone()),
            shuffle: self.controller.shuffle(),
            current: current.map(ActiveTrack::info),
            next: next.map(ActiveTrack::info),
            transition,
            halted_reason,
            sinks: Vec::new(),
            frames_played: self.mixer.frames_mixed(),
            underrun_frames: self.counters.underrun_frames,
            transitions_completed: self.counters.transitions,
            decode_failures: self.counters.decode_failures,
            updated_at: Utc::now(),
        }
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Start playback, or resume from pause with a short fade-in
    pub fn play(&mut self) -> Result<()> {
        if let TransitionState::Stopped {
            reason: StopReason::Shutdown,
        } = self.state
        {
            return Err(Error::InvalidState("engine is shut down".to_string()));
        }

        if self.is_paused() {
            self.mixer.set_state(MixerState::Playing);
            self.mixer
                .start_resume_fade(self.settings.resume_fade_frames, self.settings.transitions.curve);
            info!("Playback resumed");
            self.emit_state(PlaybackState::Playing);
            return Ok(());
        }

        if self.state.is_active() {
            return Ok(());
        }

        let cue = self
            .controller
            .current()
            .ok_or_else(|| Error::InvalidState("no active playlist".to_string()))?;
        self.state = self.start_track(cue, 0);
        self.emit_state(PlaybackState::Playing);
        Ok(())
    }

    /// Freeze the program output; decoders throttle on full buffers
    pub fn pause(&mut self) -> Result<()> {
        if !self.state.is_active() {
            return Err(Error::InvalidState("nothing is playing".to_string()));
        }
        if !self.is_paused() {
            self.mixer.set_state(MixerState::Paused);
            info!("Playback paused");
            self.emit_state(PlaybackState::Paused);
        }
        Ok(())
    }

    /// Cut to the next track
    ///
    /// During preparation or a transition this is always the track already
    /// prepared, never a third one.
    pub fn skip_next(&mut self) -> Result<()> {
        if let TransitionState::Stopped {
            reason: StopReason::Shutdown,
        } = self.state
        {
            return Err(Error::InvalidState("engine is shut down".to_string()));
        }

        let upcoming = match &self.state {
            TransitionState::PreparingNext { .. } | TransitionState::Transitioning { .. } => None,
            _ => Some(
                self.controller
                    .upcoming(0)
                    .ok_or_else(|| Error::InvalidState("no next track".to_string()))?,
            ),
        };

        let state = mem::replace(&mut self.state, TransitionState::Idle);
        self.state = match (state, upcoming) {
            (TransitionState::PlayingSingle { current }, Some(cue)) => {
                info!("Skipping to next track");
                self.prepare(current, cue, 0, Some(TransitionPlan::forced_cut()))
            }
            (TransitionState::PreparingNext { current, next, .. }, _) => {
                info!("Skipping to prepared track {}", next.cue.track.id);
                TransitionState::PreparingNext {
                    current,
                    next,
                    plan: TransitionPlan::forced_cut(),
                }
            }
            (TransitionState::Transitioning { current, next, .. }, _) => {
                info!("Skip during transition, cutting to {}", next.cue.track.id);
                self.complete(current, next)
            }
            (_, Some(cue)) => {
                let state = self.start_track(cue, 0);
                self.emit_state(PlaybackState::Playing);
                state
            }
            (state, None) => state,
        };
        Ok(())
    }

    /// Cut back to the previous track, dropping anything prepared
    pub fn skip_previous(&mut self) -> Result<()> {
        if let TransitionState::Stopped {
            reason: StopReason::Shutdown,
        } = self.state
        {
            return Err(Error::InvalidState("engine is shut down".to_string()));
        }
        let cue = self
            .controller
            .previous()
            .ok_or_else(|| Error::InvalidState("no previous track".to_string()))?;
        info!("Skipping back to {}", cue.track.id);
        self.cut_to(cue, true);
        Ok(())
    }

    /// Select a playlist; an immediate switch cuts to its first track
    pub fn select_playlist(&mut self, name: &str) -> Result<SelectOutcome> {
        let outcome = self
            .controller
            .select_playlist(name, self.state.is_active())?;
        match outcome {
            SelectOutcome::Immediate => {
                if let Some(cue) = self.controller.current() {
                    self.cut_to(cue, false);
                }
            }
            SelectOutcome::Queued | SelectOutcome::Unchanged => self.discard_prepared(),
        }
        if outcome != SelectOutcome::Unchanged {
            self.events.push(PlayoutEvent::PlaylistChanged {
                name: name.to_string(),
                queued: outcome == SelectOutcome::Queued,
                timestamp: Utc::now(),
            });
        }
        Ok(outcome)
    }

    pub fn toggle_shuffle(&mut self) -> bool {
        let enabled = !self.controller.shuffle();
        self.controller.set_shuffle(enabled);
        self.discard_prepared();
        self.events.push(PlayoutEvent::ShuffleChanged {
            enabled,
            timestamp: Utc::now(),
        });
        enabled
    }

    /// Install a newly discovered playlist set
    pub fn reload(&mut self, set: Arc<PlaylistSet>) {
        let count = set.len();
        self.controller.reload(set);
        self.discard_prepared();
        info!("Playlists reloaded ({} playlists)", count);
        self.events.push(PlayoutEvent::PlaylistsReloaded {
            playlists: count,
            timestamp: Utc::now(),
        });
    }

    /// Tear down all sessions and stop for good
    pub fn shutdown(&mut self) {
        if let TransitionState::Stopped {
            reason: StopReason::Shutdown,
        } = self.state
        {
            return;
        }
        self.state = TransitionState::Stopped {
            reason: StopReason::Shutdown,
        };
        info!("Transition engine stopped");
        self.emit_state(PlaybackState::Stopped);
    }

    /// Start `cue` with a forced cut, replacing anything prepared
    fn cut_to(&mut self, cue: Cue, announce_play: bool) {
        let state = mem::replace(&mut self.state, TransitionState::Idle);
        self.state = match state {
            TransitionState::PlayingSingle { current }
            | TransitionState::PreparingNext { current, .. }
            | TransitionState::Transitioning { current, .. } => {
                self.prepare(current, cue, 0, Some(TransitionPlan::forced_cut()))
            }
            stopped @ TransitionState::Stopped {
                reason: StopReason::Shutdown,
            } => stopped,
            TransitionState::Idle | TransitionState::Stopped { .. } if announce_play => {
                let state = self.start_track(cue, 0);
                self.emit_state(PlaybackState::Playing);
                state
            }
            other => other,
        };
    }

    /// Drop a prepared next track that the order no longer leads to
    ///
    /// Forced skips and running transitions are kept: they are already what
    /// the operator asked for, or already audible.
    fn discard_prepared(&mut self) {
        let state = mem::replace(&mut self.state, TransitionState::Idle);
        self.state = match state {
            TransitionState::PreparingNext {
                mut current,
                next,
                plan,
            } if !plan.forced => {
                debug!("Discarding prepared track {}", next.cue.track.id);
                current.tail = Tail::Continue;
                TransitionState::PlayingSingle { current }
            }
            TransitionState::PlayingSingle { mut current } => {
                if current.tail == Tail::PlaylistEnd {
                    current.tail = Tail::Continue;
                }
                TransitionState::PlayingSingle { current }
            }
            other => other,
        };
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Fill `out` with the next block of program audio
    pub fn render(&mut self, out: &mut [f32]) {
        let ch = self.settings.format.channels();
        let total = out.len() / ch;

        if self.is_paused() {
            self.mixer.fill_pause(out);
            return;
        }

        let mut filled = 0;
        let mut stalls = 0;
        while filled < total {
            self.step();
            let rest = &mut out[filled * ch..total * ch];
            match self.render_segment(rest) {
                Segment::Audio(n) => {
                    filled += n;
                    self.counters.audio_frames += n as u64;
                    stalls = 0;
                }
                Segment::Silence => {
                    rest.fill(0.0);
                    filled = total;
                }
                Segment::Stall => {
                    stalls += 1;
                    if stalls >= MAX_STALLS {
                        rest.fill(0.0);
                        self.note_underrun((total - filled) as u64);
                        filled = total;
                    }
                }
            }
        }

        self.mixer.finish_block(out);
    }

    fn render_segment(&mut self, out: &mut [f32]) -> Segment {
        let ch = self.settings.format.channels();
        let want = out.len() / ch;

        match &mut self.state {
            TransitionState::Idle | TransitionState::Stopped { .. } => Segment::Silence,

            TransitionState::PlayingSingle { current } => read_current(current, out, ch),

            TransitionState::PreparingNext { current, plan, .. } => {
                if current.fade.is_none() && plan.kind != TransitionKind::Cut {
                    match current.session.remaining_frames() {
                        // Stop exactly where the fade has to begin
                        Some(remaining) if remaining > plan.duration_frames => {
                            let limit = want.min((remaining - plan.duration_frames) as usize);
                            return read_segment(current, &mut out[..limit * ch]);
                        }
                        // Fade is due and the next track is not streaming yet
                        Some(remaining) => {
                            debug!(
                                "{} starts fading before its successor streams",
                                current.cue.track.id
                            );
                            current.fade = Some(Fade {
                                elapsed: 0,
                                duration: remaining.min(plan.duration_frames),
                                curve: plan.curve,
                            });
                        }
                        None => {}
                    }
                }
                read_current(current, out, ch)
            }

            TransitionState::Transitioning {
                current,
                next,
                plan,
                elapsed,
                joined,
            } => {
                let mut n = want.min(plan.duration_frames.saturating_sub(*elapsed) as usize);
                if !current.session.decoder_done() {
                    n = n.min(current.session.available_frames());
                }
                if plan.kind == TransitionKind::Crossfade && !next.session.decoder_done() {
                    n = n.min(next.session.available_frames());
                }
                if n == 0 {
                    return Segment::Stall;
                }

                let samples = n * ch;
                self.cur_buf.resize(samples, 0.0);
                read_padded(&mut current.session, &mut self.cur_buf, ch);
                let dst = &mut out[..samples];

                match plan.kind {
                    TransitionKind::FadeOut => {
                        dst.copy_from_slice(&self.cur_buf);
                        mixer::fade_out(dst, ch, plan.curve, *elapsed, plan.duration_frames);
                    }
                    TransitionKind::Crossfade => {
                        self.next_buf.resize(samples, 0.0);
                        read_padded(&mut next.session, &mut self.next_buf, ch);
                        mixer::crossfade(
                            dst,
                            &self.cur_buf,
                            &self.next_buf,
                            ch,
                            plan.curve,
                            *elapsed,
                            plan.duration_frames,
                            *joined,
                        );
                    }
                    TransitionKind::Cut => return Segment::Stall,
                }

                *elapsed += n as u64;
                Segment::Audio(n)
            }
        }
    }

    fn note_underrun(&mut self, frames: u64) {
        if !self.state.is_active() {
            return;
        }
        self.counters.underrun_frames += frames;
        self.underrun_events += 1;
        if self.underrun_events % UNDERRUN_LOG_INTERVAL == 1 {
            warn!(
                "Underrun: {} frames of silence inserted ({} underruns so far)",
                frames, self.underrun_events
            );
        } else {
            debug!("Underrun: {} frames of silence inserted", frames);
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn step(&mut self) {
        let state = mem::replace(&mut self.state, TransitionState::Idle);
        self.state = match state {
            TransitionState::PlayingSingle { current } => self.step_single(current),
            TransitionState::PreparingNext {
                current,
                next,
                plan,
            } => self.step_preparing(current, next, plan),
            TransitionState::Transitioning {
                current,
                next,
                plan,
                elapsed,
                joined,
            } => {
                let done = elapsed >= plan.duration_frames
                    || (plan.kind == TransitionKind::FadeOut && current.session.is_exhausted())
                    || (plan.kind == TransitionKind::Crossfade && next.session.is_exhausted());
                if done {
                    self.complete(current, next)
                } else {
                    TransitionState::Transitioning {
                        current,
                        next,
                        plan,
                        elapsed,
                        joined,
                    }
                }
            }
            other => other,
        };
    }

    fn step_single(&mut self, mut current: ActiveTrack) -> TransitionState {
        if !current.start_reported {
            match current.session.health() {
                SessionHealth::Failed(reason) => return self.recover_start(current, reason),
                SessionHealth::Ready => self.announce(&mut current),
                SessionHealth::Pending => {}
            }
        }

        if current.tail == Tail::Continue && self.should_prepare(&current) {
            match self.controller.upcoming(0) {
                Some(cue) => return self.prepare(current, cue, 0, None),
                None => {
                    debug!("No track after {}", current.cue.track.id);
                    current.tail = Tail::PlaylistEnd;
                }
            }
        }

        if current.session.is_exhausted() {
            match current.tail.clone() {
                Tail::PlaylistEnd => {
                    let name = current.cue.playlist.name.clone();
                    info!("Playlist '{}' ended", name);
                    drop(current);
                    self.controller.restart();
                    self.events.push(PlayoutEvent::PlaylistEnded {
                        name,
                        timestamp: Utc::now(),
                    });
                    self.emit_state(PlaybackState::Stopped);
                    return TransitionState::Idle;
                }
                Tail::Halt(reason) => return self.halt(reason),
                Tail::Continue => {}
            }
        }

        TransitionState::PlayingSingle { current }
    }

    fn step_preparing(
        &mut self,
        mut current: ActiveTrack,
        next: ActiveTrack,
        plan: TransitionPlan,
    ) -> TransitionState {
        if !current.start_reported {
            match current.session.health() {
                SessionHealth::Failed(reason) => {
                    self.report_failure(&current.cue, &reason);
                    current.start_reported = true;
                }
                SessionHealth::Ready => self.announce(&mut current),
                SessionHealth::Pending => {}
            }
        }

        match next.session.health() {
            SessionHealth::Pending => TransitionState::PreparingNext {
                current,
                next,
                plan,
            },
            SessionHealth::Failed(reason) => {
                self.report_failure(&next.cue, &reason);
                let failures = next.attempts + 1;
                if failures >= self.settings.max_skips_per_boundary {
                    current.tail = Tail::Halt(format!(
                        "{} consecutive tracks failed to decode",
                        failures
                    ));
                    return TransitionState::PlayingSingle { current };
                }
                match self.controller.upcoming_after(&next.cue) {
                    Some(cue) => {
                        drop(next);
                        let next = self.launch(cue, failures);
                        TransitionState::PreparingNext {
                            current,
                            next,
                            plan,
                        }
                    }
                    None => {
                        current.tail = Tail::PlaylistEnd;
                        TransitionState::PlayingSingle { current }
                    }
                }
            }
            SessionHealth::Ready => {
                let exhausted = current.session.is_exhausted();
                let boundary = plan.forced
                    || exhausted
                    || current.fade.is_some()
                    || (plan.kind != TransitionKind::Cut
                        && current
                            .session
                            .remaining_frames()
                            .is_some_and(|r| r <= plan.duration_frames));
                if boundary {
                    self.begin_transition(current, next, plan)
                } else {
                    TransitionState::PreparingNext {
                        current,
                        next,
                        plan,
                    }
                }
            }
        }
    }

    fn should_prepare(&self, current: &ActiveTrack) -> bool {
        if current.session.is_exhausted() {
            return true;
        }
        let Some(remaining) = current.session.remaining_frames() else {
            return false;
        };
        let planned = TransitionPlan::resolve(
            &current.cue,
            None,
            None,
            &self.settings.transitions,
            self.settings.format,
        );
        remaining <= self.settings.lead_time_frames + planned.duration_frames
    }

    fn launch(&self, cue: Cue, attempts: usize) -> ActiveTrack {
        let session = DecodeSession::start(
            Arc::clone(&self.backend),
            Arc::clone(&cue.track),
            &self.settings.session,
        );
        ActiveTrack {
            cue,
            session,
            attempts,
            start_reported: false,
            tail: Tail::Continue,
            fade: None,
        }
    }

    /// Make `cue` the current track with a fresh session
    fn start_track(&mut self, cue: Cue, attempts: usize) -> TransitionState {
        info!("Starting {} from '{}'", cue.track.id, cue.playlist.name);
        self.controller.commit(&cue);
        let current = self.launch(cue, attempts);
        TransitionState::PlayingSingle { current }
    }

    fn prepare(
        &mut self,
        current: ActiveTrack,
        cue: Cue,
        attempts: usize,
        plan: Option<TransitionPlan>,
    ) -> TransitionState {
        let plan = plan.unwrap_or_else(|| {
            TransitionPlan::resolve(
                &current.cue,
                current.session.remaining_frames(),
                Some(&cue),
                &self.settings.transitions,
                self.settings.format,
            )
        });
        debug!(
            "Preparing {} ({} over {} frames{})",
            cue.track.id,
            plan.kind,
            plan.duration_frames,
            if plan.forced { ", forced" } else { "" }
        );
        let next = self.launch(cue, attempts);
        TransitionState::PreparingNext {
            current,
            next,
            plan,
        }
    }

    fn begin_transition(
        &mut self,
        current: ActiveTrack,
        next: ActiveTrack,
        mut plan: TransitionPlan,
    ) -> TransitionState {
        // Carry on with a closing fade already under way, or fit the fade
        // into what the outgoing track has left
        let elapsed = match current.fade {
            Some(fade) if plan.kind != TransitionKind::Cut => {
                plan.duration_frames = fade.duration;
                fade.elapsed
            }
            _ => {
                if plan.kind != TransitionKind::Cut {
                    if let Some(remaining) = current.session.remaining_frames() {
                        plan.duration_frames = plan.duration_frames.min(remaining);
                    }
                }
                0
            }
        };
        if elapsed > 0 {
            debug!(
                "{} joins {} frames into the fade",
                next.cue.track.id, elapsed
            );
        }

        info!(
            "Transition {} -> {} ({}, {:.2}s)",
            current.cue.track.id,
            next.cue.track.id,
            plan.kind,
            self.settings.format.frames_to_secs(plan.duration_frames)
        );
        self.events.push(PlayoutEvent::TransitionStarted {
            from: current.info(),
            to: next.info(),
            transition: plan.info(self.settings.format),
            timestamp: Utc::now(),
        });

        if plan.kind == TransitionKind::Cut || elapsed >= plan.duration_frames {
            return self.complete(current, next);
        }
        TransitionState::Transitioning {
            current,
            next,
            plan,
            elapsed,
            joined: elapsed,
        }
    }

    /// Swap: the incoming track becomes the only one
    fn complete(&mut self, current: ActiveTrack, mut next: ActiveTrack) -> TransitionState {
        drop(current);
        self.controller.commit(&next.cue);
        self.counters.transitions += 1;
        self.events.push(PlayoutEvent::TransitionCompleted {
            to: next.info(),
            timestamp: Utc::now(),
        });
        next.attempts = 0;
        self.announce(&mut next);
        TransitionState::PlayingSingle { current: next }
    }

    /// The current track never produced audio: skip forward or give up
    fn recover_start(&mut self, current: ActiveTrack, reason: String) -> TransitionState {
        self.report_failure(&current.cue, &reason);
        let failures = current.attempts + 1;
        if failures >= self.settings.max_skips_per_boundary {
            return self.halt(format!("{} consecutive tracks failed to decode", failures));
        }
        let following = self.controller.upcoming_after(&current.cue);
        drop(current);
        match following {
            Some(cue) => self.start_track(cue, failures),
            None => {
                self.controller.restart();
                self.emit_state(PlaybackState::Stopped);
                TransitionState::Idle
            }
        }
    }

    fn halt(&mut self, reason: String) -> TransitionState {
        error!("Playout halted: {}", reason);
        self.events.push(PlayoutEvent::Halted {
            reason: reason.clone(),
            timestamp: Utc::now(),
        });
        TransitionState::Stopped {
            reason: StopReason::Exhausted { reason },
        }
    }

    fn announce(&mut self, track: &mut ActiveTrack) {
        if track.start_reported {
            return;
        }
        track.start_reported = true;
        info!("Now playing: {}", track.cue.track);
        self.events.push(PlayoutEvent::TrackStarted {
            track: track.info(),
            session_id: track.session.id(),
            timestamp: Utc::now(),
        });
    }

    fn report_failure(&mut self, cue: &Cue, reason: &str) {
        self.counters.decode_failures += 1;
        warn!(
            "Decode failed for {} in '{}': {}",
            cue.track.id, cue.playlist.name, reason
        );
        self.events.push(PlayoutEvent::DecodeFailed {
            track: cue.info(),
            error: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn emit_state(&mut self, state: PlaybackState) {
        self.events.push(PlayoutEvent::PlaybackStateChanged {
            state,
            timestamp: Utc::now(),
        });
    }
}

/// Read the current track, applying its closing fade if one is running
fn read_current(track: &mut ActiveTrack, out: &mut [f32], channels: usize) -> Segment {
    let segment = read_segment(track, out);
    if let (Segment::Audio(n), Some(fade)) = (&segment, track.fade.as_mut()) {
        mixer::fade_out(
            &mut out[..*n * channels],
            channels,
            fade.curve,
            fade.elapsed,
            fade.duration,
        );
        fade.elapsed += *n as u64;
    }
    segment
}

fn read_segment(track: &mut ActiveTrack, out: &mut [f32]) -> Segment {
    if out.is_empty() {
        return Segment::Stall;
    }
    match track.session.read(out) {
        ReadOutcome::Frames(n) if n > 0 => Segment::Audio(n),
        _ => Segment::Stall,
    }
}

/// Read into `buf`, zero-filling whatever the session could not provide
fn read_padded(session: &mut DecodeSession, buf: &mut [f32], channels: usize) {
    let frames = match session.read(buf) {
        ReadOutcome::Frames(n) => n,
        ReadOutcome::Underrun | ReadOutcome::EndOfStream => 0,
    };
    buf[frames * channels..].fill(0.0);
}
