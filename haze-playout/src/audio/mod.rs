//! Audio decoding and PCM format handling

pub mod decoder;
pub mod header;
pub mod types;

pub use decoder::{DecoderBackend, FfmpegDecoder, PcmSource, Pull, CHUNK_FRAMES};
pub use header::{CoverArt, TrackTags};
pub use types::PcmFormat;
