//! # Haze Common Library
//!
//! Shared code for the Haze playout engine and its operator interfaces:
//! - Error type and `Result` alias
//! - Fade curve definitions
//! - Configuration model, loading and validation
//! - Control events, status snapshots and broadcast events

pub mod config;
pub mod error;
pub mod events;
pub mod fade_curves;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{ControlEvent, PlayoutEvent, PlayoutStatus, TransitionKind};
pub use fade_curves::FadeCurve;
