//! Playout core: decode sessions, transitions, and the runtime loop

pub mod controller;
pub mod engine;
pub mod mixer;
pub mod ring_buffer;
pub mod session;
pub mod shuffle;
pub mod transition;

pub use controller::{ControllerSettings, Cue, PlayoutController, SelectOutcome};
pub use engine::{build_fanout, PlayoutEngine, PlayoutHandle, RuntimeOptions};
pub use session::{DecodeSession, SessionHealth, SessionSettings, SessionState};
pub use transition::{
    EngineCounters, EngineSettings, StopReason, TransitionEngine, TransitionPlan, TransitionState,
};
