//! DCA (Discord Compatible Audio) reader.
//!
//! DCA is a trivial framing for pre-encoded Opus: DCA1 files open with a
//! `DCA1` magic and a length-prefixed JSON metadata blob, then both DCA0
//! and DCA1 carry frames as a little-endian `i16` length followed by
//! that many bytes of raw Opus.

use crate::error::VoiceError;
use crate::piper::OpusSource;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on a single frame; anything bigger is a corrupt file.
const MAX_FRAME_SIZE: usize = 8 * 1024;

/// Upper bound on the DCA1 metadata blob.
const MAX_METADATA_SIZE: u32 = 1024 * 1024;

/// Reader over a DCA0/DCA1 byte stream.
pub struct DcaSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    metadata: Option<serde_json::Value>,
}

impl DcaSource {
    /// Parse the header and position the reader at the first frame.
    pub async fn new(
        mut reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Result<Self, VoiceError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;

        if &magic == b"DCA1" {
            let len = reader.read_i32_le().await?;
            if len < 0 || len as u32 > MAX_METADATA_SIZE {
                return Err(VoiceError::Source(format!(
                    "unreasonable DCA metadata length {len}"
                )));
            }
            let mut blob = vec![0u8; len as usize];
            reader.read_exact(&mut blob).await?;
            let metadata = serde_json::from_slice(&blob).ok();

            Ok(Self {
                reader: Box::new(reader),
                metadata,
            })
        } else {
            // DCA0 has no header: those four bytes were frame data.
            Ok(Self {
                reader: Box::new(Cursor::new(magic.to_vec()).chain(reader)),
                metadata: None,
            })
        }
    }

    /// DCA1 metadata blob, if the file carried one.
    pub fn metadata(&self) -> Option<&serde_json::Value> {
        self.metadata.as_ref()
    }

    async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, VoiceError> {
        // A clean EOF before the length prefix is the end of the stream.
        let mut len_bytes = [0u8; 2];
        let mut filled = 0;
        while filled < len_bytes.len() {
            let n = self.reader.read(&mut len_bytes[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(VoiceError::Source("truncated DCA frame length".to_string()));
            }
            filled += n;
        }

        let len = i16::from_le_bytes(len_bytes);
        if len <= 0 || len as usize > MAX_FRAME_SIZE {
            return Err(VoiceError::Source(format!("invalid DCA frame length {len}")));
        }

        let mut frame = vec![0u8; len as usize];
        self.reader.read_exact(&mut frame).await?;
        Ok(Some(frame))
    }
}

impl OpusSource for DcaSource {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>> {
        self.read_frame().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(bytes: &[u8]) -> Vec<u8> {
        let mut out = (bytes.len() as i16).to_le_bytes().to_vec();
        out.extend_from_slice(bytes);
        out
    }

    #[tokio::test]
    async fn reads_dca1_with_metadata() {
        let metadata = br#"{"dca":{"version":1}}"#;
        let mut data = b"DCA1".to_vec();
        data.extend_from_slice(&(metadata.len() as i32).to_le_bytes());
        data.extend_from_slice(metadata);
        data.extend(frame(b"first"));
        data.extend(frame(b"second"));

        let mut source = DcaSource::new(Cursor::new(data)).await.unwrap();
        assert!(source.metadata().is_some());
        assert_eq!(source.next_frame().await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(source.next_frame().await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reads_headerless_dca0() {
        let mut data = Vec::new();
        data.extend(frame(b"alpha"));
        data.extend(frame(b"bravo"));

        let mut source = DcaSource::new(Cursor::new(data)).await.unwrap();
        assert!(source.metadata().is_none());
        assert_eq!(source.next_frame().await.unwrap(), Some(b"alpha".to_vec()));
        assert_eq!(source.next_frame().await.unwrap(), Some(b"bravo".to_vec()));
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_negative_frame_length() {
        let mut data = b"DCA1".to_vec();
        data.extend_from_slice(&2i32.to_le_bytes());
        data.extend_from_slice(b"{}");
        data.extend_from_slice(&(-5i16).to_le_bytes());

        let mut source = DcaSource::new(Cursor::new(data)).await.unwrap();
        assert!(source.next_frame().await.is_err());
    }
}
