//! Incremental Ogg/Opus demuxer.
//!
//! Reads Ogg pages off any async byte stream and reassembles the Opus
//! packets inside, following the lacing rules: segments of 255 bytes
//! continue into the next segment (or page, with the continuation flag).
//! The `OpusHead` and `OpusTags` header packets are consumed silently.

use crate::error::VoiceError;
use crate::piper::OpusSource;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

/// Fixed part of an Ogg page header.
const PAGE_HEADER_SIZE: usize = 27;

/// Magic opening every page.
const CAPTURE_PATTERN: &[u8; 4] = b"OggS";

/// Continuation flag in the page header type byte.
const FLAG_CONTINUED: u8 = 0x01;

/// Demuxer over one Ogg/Opus logical stream.
pub struct OggOpusSource {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Completed packets waiting to be handed out.
    packets: VecDeque<Vec<u8>>,
    /// A packet spanning a page boundary, accumulated so far.
    partial: Vec<u8>,
    finished: bool,
}

impl OggOpusSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            reader: Box::new(reader),
            packets: VecDeque::new(),
            partial: Vec::new(),
            finished: false,
        }
    }

    async fn next_packet(&mut self) -> Result<Option<Vec<u8>>, VoiceError> {
        loop {
            if let Some(packet) = self.packets.pop_front() {
                if is_header_packet(&packet) {
                    continue;
                }
                return Ok(Some(packet));
            }
            if self.finished {
                return Ok(None);
            }
            self.read_page().await?;
        }
    }

    /// Read one page and queue every packet it completes.
    async fn read_page(&mut self) -> Result<(), VoiceError> {
        let mut header = [0u8; PAGE_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let n = self.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    self.finished = true;
                    return Ok(());
                }
                return Err(VoiceError::Source("truncated Ogg page header".to_string()));
            }
            filled += n;
        }

        if &header[0..4] != CAPTURE_PATTERN {
            return Err(VoiceError::Source("missing OggS capture pattern".to_string()));
        }
        if header[4] != 0 {
            return Err(VoiceError::Source(format!(
                "unsupported Ogg version {}",
                header[4]
            )));
        }

        let header_type = header[5];
        // Granule position, serial, sequence and CRC are not needed for
        // packet extraction.
        let segment_count = header[26] as usize;

        let mut lacing = vec![0u8; segment_count];
        self.reader.read_exact(&mut lacing).await?;

        if header_type & FLAG_CONTINUED == 0 && !self.partial.is_empty() {
            warn!(orphaned = self.partial.len(), "dropping unterminated Ogg packet");
            self.partial.clear();
        }

        for &segment in &lacing {
            let mut chunk = vec![0u8; segment as usize];
            self.reader.read_exact(&mut chunk).await?;
            self.partial.extend_from_slice(&chunk);

            // A lacing value under 255 terminates the packet; a 255
            // segment always continues into the next one.
            if segment < 255 {
                self.packets.push_back(std::mem::take(&mut self.partial));
            }
        }

        Ok(())
    }
}

fn is_header_packet(packet: &[u8]) -> bool {
    packet.starts_with(b"OpusHead") || packet.starts_with(b"OpusTags")
}

impl OpusSource for OggOpusSource {
    fn next_frame(&mut self) -> BoxFuture<'_, Result<Option<Vec<u8>>, VoiceError>> {
        self.next_packet().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Serialize packets into pages, `packets_per_page` at a time, with
    /// correct lacing (a zero-length final segment after exact 255
    /// multiples).
    fn build_page(packets: &[&[u8]], continued: bool, carry: Option<&[u8]>) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut body = Vec::new();

        if let Some(carry) = carry {
            // Leading continuation data, terminated within this page.
            for chunk in carry.chunks(255) {
                lacing.push(chunk.len() as u8);
            }
            if carry.len() % 255 == 0 {
                lacing.push(0);
            }
            body.extend_from_slice(carry);
        }

        for packet in packets {
            for chunk in packet.chunks(255) {
                lacing.push(chunk.len() as u8);
            }
            if packet.is_empty() || packet.len() % 255 == 0 {
                lacing.push(0);
            }
            body.extend_from_slice(packet);
        }

        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.push(0); // version
        page.push(if continued { FLAG_CONTINUED } else { 0 });
        page.extend_from_slice(&[0u8; 8]); // granule
        page.extend_from_slice(&[0u8; 4]); // serial
        page.extend_from_slice(&[0u8; 4]); // page sequence
        page.extend_from_slice(&[0u8; 4]); // crc (unchecked)
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(&body);
        page
    }

    #[tokio::test]
    async fn demuxes_packets_and_skips_headers() {
        let mut data = Vec::new();
        data.extend(build_page(&[b"OpusHead\x01\x02"], false, None));
        data.extend(build_page(&[b"OpusTags vendor"], false, None));
        data.extend(build_page(&[b"frame-1", b"frame-2"], false, None));

        let mut source = OggOpusSource::new(Cursor::new(data));
        assert_eq!(source.next_frame().await.unwrap(), Some(b"frame-1".to_vec()));
        assert_eq!(source.next_frame().await.unwrap(), Some(b"frame-2".to_vec()));
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reassembles_packet_spanning_pages() {
        // 300-byte packet: 255-byte segment on page 1, remainder
        // continued on page 2.
        let packet = vec![0xAB; 300];

        let mut page1 = Vec::new();
        page1.extend_from_slice(b"OggS");
        page1.push(0);
        page1.push(0);
        page1.extend_from_slice(&[0u8; 20]);
        page1.push(1); // one segment
        page1.push(255);
        page1.extend_from_slice(&packet[..255]);

        let page2 = build_page(&[], true, Some(&packet[255..]));

        let mut data = page1;
        data.extend(page2);

        let mut source = OggOpusSource::new(Cursor::new(data));
        assert_eq!(source.next_frame().await.unwrap(), Some(packet));
        assert_eq!(source.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_input_is_an_error() {
        let mut source = OggOpusSource::new(Cursor::new(vec![0u8; 64]));
        assert!(source.next_frame().await.is_err());
    }
}
