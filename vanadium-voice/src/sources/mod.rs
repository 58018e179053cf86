//! Concrete audio sources: container demuxers and the external encoder.
//!
//! - [`DcaSource`] reads DCA0/DCA1 (length-prefixed raw Opus frames)
//! - [`OggOpusSource`] demuxes Ogg/Opus pages from any async reader
//! - [`FfmpegSource`] pipes anything else (PCM, WebM, MP3, URLs) through
//!   a detected `ffmpeg`/`avconv` binary that re-encodes to Ogg/Opus

mod dca;
mod ffmpeg;
mod ogg;

pub use dca::DcaSource;
pub use ffmpeg::{ffmpeg_binary, FfmpegOptions, FfmpegSource};
pub use ogg::OggOpusSource;
