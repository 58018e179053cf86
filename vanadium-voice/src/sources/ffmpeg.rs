//! External encoder pipe.
//!
//! Inputs the library cannot demux natively (PCM, WebM/MKV, MP3, remote
//! URLs) are handed to a spawned `ffmpeg` (or `avconv`) process that
//! re-encodes to Ogg/Opus on stdout, which the regular Ogg demuxer then
//! consumes. The binary is probed once per process.

use super::ogg::OggOpusSource;
use crate::error::VoiceError;
use crate::piper::OpusSource;
use futures_util::future::BoxFuture;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::{Child, Command};
use tracing::{debug, info};

static FFMPEG_BINARY: OnceLock<Option<&'static str>> = OnceLock::new();

/// The encoder binary available on this system, probed once.
///
/// `ffmpeg` is preferred, `avconv` accepted.
pub fn ffmpeg_binary() -> Option<&'static str> {
    *FFMPEG_BINARY.get_or_init(|| {
        for candidate in ["ffmpeg", "avconv"] {
            let found = std::process::Command::new(candidate)
                .arg("-version")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false);
            if found {
                info!(binary = candidate, "external encoder detected");
                return Some(candidate);
            }
        }
        None
    })
}

/// Options for the encoder invocation.
#[derive(Debug, Clone, Default)]
pub struct FfmpegOptions {
    /// Linear volume multiplier applied before encoding (1.0 = unchanged).
    pub volume: Option<f64>,

    /// Arguments placed before `-i` (input format hints, e.g.
    /// `["-f", "s16le", "-ar", "48000", "-ac", "2"]` for raw PCM).
    pub input_args: Vec<String>,

    /// Extra arguments placed before the output spec.
    pub encoder_args: Vec<String>,
}

/// An Opus source backed by a child encoder process.
pub struct FfmpegSource {
    child: Child,
    demux: OggOpusSource,
}

impl FfmpegSource {
    /// Spawn the encoder over `input` (a path or URL).
    ///
    /// The child is killed when this source is dropped.
    pub fn spawn(input: &str, options: FfmpegOptions) -> Result<Self, VoiceError> {
        let binary = ffmpeg_binary().ok_or(VoiceError::EncoderUnavailable)?;

        let mut command = Command::new(binary);
        command
            .args(&options.input_args)
            .arg("-i")
            .arg(input)
            .args(["-vn", "-map_metadata", "-1"])
            .args(["-c:a", "libopus", "-f", "ogg", "-ar", "48000", "-ac", "2"]);

        if let Some(volume) = options.volume {
            command.args(["-filter:a", &format!("volume={volume}")]);
        }

        command
            .args(&options.encoder_args)
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        debug!(binary, input, "spawning external encoder");
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Source("encoder stdout unavailable".to_string()))?;

        Ok(Self {
            child,
            demux: OggOpusSource::new(stdout),
        })
    }

    /// Whether the child is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

impl OpusSource for FfmpegSource {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>> {
        self.demux.next_frame()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_is_memoized() {
        // Two calls must agree (and not re-probe observably).
        assert_eq!(ffmpeg_binary(), ffmpeg_binary());
    }

    #[test]
    fn spawn_without_binary_is_clean_error() {
        if ffmpeg_binary().is_none() {
            assert!(matches!(
                FfmpegSource::spawn("/tmp/in.wav", FfmpegOptions::default()),
                Err(VoiceError::EncoderUnavailable)
            ));
        }
    }
}
