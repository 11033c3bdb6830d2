//! HTTP control API
//!
//! Handlers never touch the engine directly: commands become
//! [`ControlEvent`](haze_common::ControlEvent)s on the playout handle, reads
//! come from the status snapshot in [`SharedState`](crate::state::SharedState).

pub mod handlers;
pub mod server;
pub mod sse;

pub use server::{create_router, run, AppContext};
