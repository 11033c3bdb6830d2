//! Error types for haze-playout
//!
//! Every failure the pipeline can hit maps to one variant here. Decode and
//! sink errors are recoverable and handled where they occur (skip the track,
//! reconnect the sink); configuration errors stop the process before any
//! audio flows.

use thiserror::Error;

/// Main error type for the playout engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Decoder failed to start, stalled, or produced no audio
    #[error("Audio decode error: {0}")]
    Decode(String),

    /// Output sink failed to open or accept audio
    #[error("Sink error: {0}")]
    Sink(String),

    /// Playlist file unreadable or malformed
    #[error("Playlist error: {0}")]
    Playlist(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the shared library
    #[error(transparent)]
    Common(#[from] haze_common::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience Result type using the playout Error
pub type Result<T> = std::result::Result<T, Error>;
