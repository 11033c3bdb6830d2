//! # Haze Playout Library (haze-playout)
//!
//! Continuous audio playout: decodes playlist tracks ahead of time, joins
//! them with cuts, fades or crossfades, and fans the mixed program out to a
//! sound card and network encoders.
//!
//! **Architecture:** one decode thread per live track feeding a lock-free
//! ring buffer, a timer-driven mix loop owning all playout state, and one
//! worker thread per output sink. Operators talk to the mix loop through
//! control events (HTTP API) and watch it through SSE.

pub mod api;
pub mod audio;
pub mod error;
pub mod now_playing;
pub mod playback;
pub mod playlist;
pub mod sinks;
pub mod state;

pub use error::{Error, Result};
pub use playback::{PlayoutEngine, PlayoutHandle};
pub use state::SharedState;
