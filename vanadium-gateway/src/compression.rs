//! Zlib-stream decompression for the gateway.
//!
//! With `compress=zlib-stream`, every WebSocket frame extends a single
//! shared zlib context for the whole session. A logical message is
//! complete when the accumulated bytes end with the sync-flush suffix
//! `00 00 FF FF`; decompressing with anything less yields a partial
//! message, so frames are buffered until the suffix arrives.

use flate2::{Decompress, FlushDecompress, Status};

/// Sync-flush suffix marking the end of one gateway message.
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Initial size of the inflate output buffer.
const OUTPUT_CHUNK: usize = 32 * 1024;

/// Shared-context inflater for one gateway session.
///
/// The inflate dictionary must survive across messages, so the same
/// [`Decompress`] instance is reused for the connection's lifetime and
/// only [`reset`](Self::reset) on a fresh socket.
pub struct ZlibStreamInflater {
    /// Compressed bytes accumulated since the last complete message.
    pending: Vec<u8>,
    /// Reusable decompressed output.
    output: Vec<u8>,
    inner: Decompress,
}

impl ZlibStreamInflater {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(8 * 1024),
            output: Vec::with_capacity(OUTPUT_CHUNK),
            // Discord sends a zlib header on the first frame.
            inner: Decompress::new(true),
        }
    }

    /// Feed one WebSocket frame.
    ///
    /// Returns the decompressed message when this frame completed one,
    /// `None` when more frames are needed. The returned slice is valid
    /// until the next call.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<&[u8]>, std::io::Error> {
        self.pending.extend_from_slice(frame);

        if self.pending.len() < ZLIB_SUFFIX.len()
            || self.pending[self.pending.len() - ZLIB_SUFFIX.len()..] != ZLIB_SUFFIX
        {
            return Ok(None);
        }

        self.inflate_pending()?;
        self.pending.clear();
        Ok(Some(&self.output))
    }

    fn inflate_pending(&mut self) -> Result<(), std::io::Error> {
        self.output.clear();
        let mut consumed_total = 0usize;

        loop {
            let len = self.output.len();
            if len == self.output.capacity() {
                self.output.reserve(OUTPUT_CHUNK);
            }
            let cap = self.output.capacity();
            self.output.resize(cap, 0);

            let before_in = self.inner.total_in();
            let before_out = self.inner.total_out();

            let status = self
                .inner
                .decompress(
                    &self.pending[consumed_total..],
                    &mut self.output[len..],
                    FlushDecompress::Sync,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            consumed_total += (self.inner.total_in() - before_in) as usize;
            let written = (self.inner.total_out() - before_out) as usize;
            self.output.truncate(len + written);

            match status {
                Status::Ok if consumed_total >= self.pending.len() => break,
                Status::Ok | Status::BufError => continue,
                Status::StreamEnd => break,
            }
        }

        Ok(())
    }

    /// Discard buffered state for a new connection.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.output.clear();
        self.inner.reset(true);
    }
}

impl Default for ZlibStreamInflater {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, Compression, FlushCompress};

    /// Compress a message the way the gateway does: one shared context,
    /// sync-flushed per message.
    struct StreamCompressor(Compress);

    impl StreamCompressor {
        fn new() -> Self {
            Self(Compress::new(Compression::default(), true))
        }

        fn push(&mut self, msg: &[u8]) -> Vec<u8> {
            let before = self.0.total_out();
            let mut out = Vec::with_capacity(msg.len() + 1024);
            self.0
                .compress_vec(msg, &mut out, FlushCompress::Sync)
                .unwrap();
            out.truncate((self.0.total_out() - before) as usize);
            out
        }
    }

    #[test]
    fn single_message_roundtrip() {
        let msg = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let mut compressor = StreamCompressor::new();
        let mut inflater = ZlibStreamInflater::new();

        let compressed = compressor.push(msg);
        let out = inflater.push(&compressed).unwrap().expect("complete");
        assert_eq!(out, msg);
    }

    #[test]
    fn split_frames_buffer_until_suffix() {
        let msg = br#"{"t":"READY","s":1,"op":0,"d":{"v":10}}"#;
        let mut compressor = StreamCompressor::new();
        let mut inflater = ZlibStreamInflater::new();

        let compressed = compressor.push(msg);
        let (a, b) = compressed.split_at(compressed.len() / 2);

        assert!(inflater.push(a).unwrap().is_none());
        let out = inflater.push(b).unwrap().expect("complete");
        assert_eq!(out, msg);
    }

    #[test]
    fn context_survives_across_messages() {
        let first = br#"{"op":0,"t":"MESSAGE_CREATE","d":{"content":"hello hello hello"}}"#;
        let second = br#"{"op":0,"t":"MESSAGE_CREATE","d":{"content":"hello hello again"}}"#;
        let mut compressor = StreamCompressor::new();
        let mut inflater = ZlibStreamInflater::new();

        let out = inflater.push(&compressor.push(first)).unwrap().unwrap();
        assert_eq!(out, first);
        let out = inflater.push(&compressor.push(second)).unwrap().unwrap();
        assert_eq!(out, second);
    }
}
