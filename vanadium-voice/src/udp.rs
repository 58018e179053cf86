//! UDP data plane: IP discovery and RTP frame transmission.

use crate::crypto::{build_rtp_header, VoiceCrypto, RTP_HEADER_SIZE};
use crate::error::VoiceError;
use crate::payload::EncryptionMode;
use byteorder::{BigEndian, ByteOrder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Samples per 20 ms frame at 48 kHz.
pub const SAMPLES_PER_FRAME: u32 = 960;

/// Size of the IP discovery packet.
const DISCOVERY_PACKET_SIZE: usize = 74;

/// The Opus silence frame.
pub const SILENCE_FRAME: &[u8] = &[0xF8, 0xFF, 0xFE];

/// Number of silence frames to send when audio stops, so Opus decoders
/// on the far end can wind down cleanly.
pub const SILENCE_FRAME_COUNT: u32 = 5;

/// Voice UDP transport with the session's RTP state.
pub struct VoiceUdp {
    socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    ssrc: u32,
    crypto: Option<VoiceCrypto>,
    sequence: u16,
    timestamp: u32,
}

impl VoiceUdp {
    /// Bind a socket and point it at the voice server.
    pub async fn connect(server_ip: &str, server_port: u16, ssrc: u32) -> Result<Self, VoiceError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr: SocketAddr = format!("{server_ip}:{server_port}")
            .parse()
            .map_err(|e| VoiceError::IpDiscovery(format!("invalid server address: {e}")))?;
        socket.connect(server_addr).await?;

        info!(addr = %server_addr, ssrc, "voice UDP connected");

        Ok(Self {
            socket: Arc::new(socket),
            server_addr,
            ssrc,
            crypto: None,
            sequence: rand::random(),
            timestamp: rand::random(),
        })
    }

    /// Perform IP discovery.
    ///
    /// Sends a 74-byte request `[type=0x1, length=70, ssrc, 64B pad, 2B]`
    /// and parses the external address out of bytes 8..72 and the port
    /// out of 72..74 of the echo.
    pub async fn discover_ip(&self) -> Result<(String, u16), VoiceError> {
        let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
        BigEndian::write_u16(&mut packet[0..2], 0x0001);
        BigEndian::write_u16(&mut packet[2..4], 70);
        BigEndian::write_u32(&mut packet[4..8], self.ssrc);

        self.socket.send(&packet).await?;

        let mut response = [0u8; DISCOVERY_PACKET_SIZE];
        let timeout = tokio::time::Duration::from_secs(5);
        let len = tokio::time::timeout(timeout, self.socket.recv(&mut response))
            .await
            .map_err(|_| VoiceError::Timeout("IP discovery"))??;

        if len < DISCOVERY_PACKET_SIZE {
            return Err(VoiceError::IpDiscovery(format!(
                "response too short: {len} bytes"
            )));
        }
        if BigEndian::read_u16(&response[0..2]) != 0x0002 {
            return Err(VoiceError::IpDiscovery("unexpected response type".to_string()));
        }

        let address_bytes = &response[8..72];
        let end = address_bytes.iter().position(|&b| b == 0).unwrap_or(64);
        let address = std::str::from_utf8(&address_bytes[..end])
            .map_err(|_| VoiceError::IpDiscovery("address is not UTF-8".to_string()))?
            .to_string();
        let port = BigEndian::read_u16(&response[72..74]);

        info!(ip = %address, port, "IP discovery complete");
        Ok((address, port))
    }

    /// Install the session key once SESSION_DESCRIPTION arrives.
    pub fn set_secret(&mut self, secret_key: &[u8], mode: EncryptionMode) -> Result<(), VoiceError> {
        let key: &[u8; 32] = secret_key
            .try_into()
            .map_err(|_| VoiceError::Crypto(format!("key must be 32 bytes, got {}", secret_key.len())))?;
        self.crypto = Some(VoiceCrypto::new(key, mode));
        debug!(mode = %mode, "voice encryption configured");
        Ok(())
    }

    /// Whether the key has been installed.
    pub fn is_ready(&self) -> bool {
        self.crypto.is_some()
    }

    /// Seal and send one Opus frame, stepping the RTP state: sequence
    /// +1 mod 2^16, timestamp +960 mod 2^32.
    pub async fn send_frame(&mut self, opus: &[u8]) -> Result<(), VoiceError> {
        let crypto = self.crypto.as_mut().ok_or(VoiceError::NotConnected)?;

        let header = build_rtp_header(self.sequence, self.timestamp, self.ssrc);
        let packet = crypto.seal(&header, opus)?;

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(SAMPLES_PER_FRAME);

        self.socket.send(&packet).await?;
        Ok(())
    }

    /// Account for frames of silence that were never sent: the timestamp
    /// keeps tracking wall-clock audio position, the sequence does not
    /// move (sequence numbers count packets, not time).
    pub fn skip_frames(&mut self, frames: u32) {
        self.timestamp = self
            .timestamp
            .wrapping_add(SAMPLES_PER_FRAME.wrapping_mul(frames));
    }

    /// Send the trailing silence burst that ends a stream.
    pub async fn send_silence(&mut self) -> Result<(), VoiceError> {
        for _ in 0..SILENCE_FRAME_COUNT {
            self.send_frame(SILENCE_FRAME).await?;
        }
        Ok(())
    }

    /// Receive and open one packet, returning the sender's SSRC and the
    /// Opus payload.
    pub async fn recv_frame(&self, buf: &mut [u8]) -> Result<(u32, Vec<u8>), VoiceError> {
        let crypto = self.crypto.as_ref().ok_or(VoiceError::NotConnected)?;

        let len = self.socket.recv(buf).await?;
        if len < RTP_HEADER_SIZE {
            return Err(VoiceError::Crypto("packet too short".to_string()));
        }

        let (header, opus) = crypto.open(&buf[..len])?;
        let ssrc = BigEndian::read_u32(&header[8..12]);
        Ok((ssrc, opus))
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Current RTP (sequence, timestamp), mostly for diagnostics.
    pub fn rtp_state(&self) -> (u16, u32) {
        (self.sequence, self.timestamp)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, VoiceError> {
        self.socket.local_addr().map_err(VoiceError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_SIZE;

    async fn loopback_udp() -> (VoiceUdp, UdpSocket) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let udp = VoiceUdp::connect("127.0.0.1", addr.port(), 1234).await.unwrap();
        (udp, server)
    }

    #[tokio::test]
    async fn rtp_state_steps_per_frame() {
        let (mut udp, server) = loopback_udp().await;
        udp.set_secret(&[0u8; KEY_SIZE], EncryptionMode::default()).unwrap();

        let (seq0, ts0) = udp.rtp_state();
        udp.send_frame(SILENCE_FRAME).await.unwrap();
        udp.send_frame(SILENCE_FRAME).await.unwrap();

        let (seq1, ts1) = udp.rtp_state();
        assert_eq!(seq1, seq0.wrapping_add(2));
        assert_eq!(ts1, ts0.wrapping_add(2 * SAMPLES_PER_FRAME));

        // Packets actually hit the wire.
        let mut buf = [0u8; 128];
        let n = server.recv(&mut buf).await.unwrap();
        assert!(n > RTP_HEADER_SIZE);
    }

    #[tokio::test]
    async fn skip_frames_advances_timestamp_only() {
        let (mut udp, _server) = loopback_udp().await;
        udp.set_secret(&[0u8; KEY_SIZE], EncryptionMode::default()).unwrap();

        let (seq0, ts0) = udp.rtp_state();
        udp.skip_frames(3);
        let (seq1, ts1) = udp.rtp_state();
        assert_eq!(seq1, seq0);
        assert_eq!(ts1, ts0.wrapping_add(3 * SAMPLES_PER_FRAME));
    }

    #[tokio::test]
    async fn sending_without_key_fails() {
        let (mut udp, _server) = loopback_udp().await;
        assert!(matches!(
            udp.send_frame(SILENCE_FRAME).await,
            Err(VoiceError::NotConnected)
        ));
    }

    #[test]
    fn discovery_packet_layout() {
        let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
        BigEndian::write_u16(&mut packet[0..2], 0x0001);
        BigEndian::write_u16(&mut packet[2..4], 70);
        BigEndian::write_u32(&mut packet[4..8], 0xDEAD_BEEF);

        assert_eq!(packet.len(), 74);
        assert_eq!(BigEndian::read_u16(&packet[0..2]), 1);
        assert_eq!(BigEndian::read_u16(&packet[2..4]), 70);
        assert_eq!(BigEndian::read_u32(&packet[4..8]), 0xDEAD_BEEF);
    }
}
