//! Common error types for Haze

use thiserror::Error;

/// Common result type for Haze operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by every Haze crate
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Decoder process failed or produced no usable audio
    #[error("Decode error: {0}")]
    Decode(String),

    /// Output sink failed to open or accept audio
    #[error("Sink error: {0}")]
    Sink(String),

    /// Playlist file could not be read or parsed
    #[error("Playlist error: {0}")]
    Playlist(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}
