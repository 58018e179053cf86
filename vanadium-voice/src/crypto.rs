//! Voice packet encryption.
//!
//! Both supported modes are AEAD "rtpsize" modes: the 12-byte RTP header
//! travels in the clear but is authenticated as associated data, the Opus
//! payload is sealed, and a 32-bit per-packet counter is appended to the
//! packet, zero-extended into the cipher nonce on both ends.
//!
//! Packet layout: `rtp_header || ciphertext || tag || counter_be32`.

use crate::error::VoiceError;
use crate::payload::EncryptionMode;
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit};
use byteorder::{BigEndian, ByteOrder};
use chacha20poly1305::XChaCha20Poly1305;

/// Size of the packet encryption key.
pub const KEY_SIZE: usize = 32;

/// XChaCha20 nonce size.
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// AES-GCM nonce size.
pub const AES_GCM_NONCE_SIZE: usize = 12;

/// Poly1305/GCM authentication tag size.
pub const TAG_SIZE: usize = 16;

/// RTP header size (no CSRCs, no extension).
pub const RTP_HEADER_SIZE: usize = 12;

/// Bytes of per-packet counter carried at the end of the packet.
pub const NONCE_SUFFIX_SIZE: usize = 4;

/// Opus payload type Discord uses.
const RTP_PAYLOAD_TYPE: u8 = 0x78;

enum Cipher {
    XChaCha20(Box<XChaCha20Poly1305>),
    Aes256Gcm(Box<Aes256Gcm>),
}

/// Seals and opens voice packets for one session.
pub struct VoiceCrypto {
    cipher: Cipher,
    mode: EncryptionMode,
    /// Per-packet counter forming the nonce; wraps at 2^32.
    counter: u32,
}

impl VoiceCrypto {
    /// Create a crypto context from the session key and selected mode.
    pub fn new(secret_key: &[u8; KEY_SIZE], mode: EncryptionMode) -> Self {
        let cipher = match mode {
            EncryptionMode::AeadXChaCha20Poly1305Rtpsize => {
                Cipher::XChaCha20(Box::new(XChaCha20Poly1305::new(secret_key.into())))
            }
            EncryptionMode::AeadAes256GcmRtpsize => {
                Cipher::Aes256Gcm(Box::new(Aes256Gcm::new(secret_key.into())))
            }
        };
        Self {
            cipher,
            mode,
            counter: 0,
        }
    }

    /// The mode this context seals with.
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Seal one frame into a full packet.
    pub fn seal(
        &mut self,
        rtp_header: &[u8; RTP_HEADER_SIZE],
        opus: &[u8],
    ) -> Result<Vec<u8>, VoiceError> {
        let counter = self.counter;
        self.counter = self.counter.wrapping_add(1);

        let mut counter_bytes = [0u8; NONCE_SUFFIX_SIZE];
        BigEndian::write_u32(&mut counter_bytes, counter);

        let sealed = match &self.cipher {
            Cipher::XChaCha20(cipher) => {
                let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
                nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&counter_bytes);
                cipher.encrypt(
                    (&nonce).into(),
                    Payload {
                        msg: opus,
                        aad: rtp_header,
                    },
                )
            }
            Cipher::Aes256Gcm(cipher) => {
                let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
                nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&counter_bytes);
                cipher.encrypt(
                    (&nonce).into(),
                    Payload {
                        msg: opus,
                        aad: rtp_header,
                    },
                )
            }
        }
        .map_err(|_| VoiceError::Crypto("sealing failed".to_string()))?;

        let mut packet =
            Vec::with_capacity(RTP_HEADER_SIZE + sealed.len() + NONCE_SUFFIX_SIZE);
        packet.extend_from_slice(rtp_header);
        packet.extend_from_slice(&sealed);
        packet.extend_from_slice(&counter_bytes);
        Ok(packet)
    }

    /// Open a received packet into its header and Opus payload.
    pub fn open(&self, packet: &[u8]) -> Result<([u8; RTP_HEADER_SIZE], Vec<u8>), VoiceError> {
        if packet.len() < RTP_HEADER_SIZE + TAG_SIZE + NONCE_SUFFIX_SIZE {
            return Err(VoiceError::Crypto("packet too short".to_string()));
        }

        let mut rtp_header = [0u8; RTP_HEADER_SIZE];
        rtp_header.copy_from_slice(&packet[..RTP_HEADER_SIZE]);

        let counter_start = packet.len() - NONCE_SUFFIX_SIZE;
        let sealed = &packet[RTP_HEADER_SIZE..counter_start];

        let opus = match &self.cipher {
            Cipher::XChaCha20(cipher) => {
                let mut nonce = [0u8; XCHACHA_NONCE_SIZE];
                nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&packet[counter_start..]);
                cipher.decrypt(
                    (&nonce).into(),
                    Payload {
                        msg: sealed,
                        aad: &rtp_header,
                    },
                )
            }
            Cipher::Aes256Gcm(cipher) => {
                let mut nonce = [0u8; AES_GCM_NONCE_SIZE];
                nonce[..NONCE_SUFFIX_SIZE].copy_from_slice(&packet[counter_start..]);
                cipher.decrypt(
                    (&nonce).into(),
                    Payload {
                        msg: sealed,
                        aad: &rtp_header,
                    },
                )
            }
        }
        .map_err(|_| VoiceError::Crypto("authentication failed".to_string()))?;

        Ok((rtp_header, opus))
    }
}

/// Build a 12-byte RTP header.
pub fn build_rtp_header(sequence: u16, timestamp: u32, ssrc: u32) -> [u8; RTP_HEADER_SIZE] {
    let mut header = [0u8; RTP_HEADER_SIZE];
    // Version 2, no padding, no extension, no CSRCs.
    header[0] = 0x80;
    // No marker; payload type 0x78 (Opus).
    header[1] = RTP_PAYLOAD_TYPE;
    BigEndian::write_u16(&mut header[2..4], sequence);
    BigEndian::write_u32(&mut header[4..8], timestamp);
    BigEndian::write_u32(&mut header[8..12], ssrc);
    header
}

/// Parse a 12-byte RTP header into (sequence, timestamp, ssrc).
pub fn parse_rtp_header(header: &[u8; RTP_HEADER_SIZE]) -> (u16, u32, u32) {
    (
        BigEndian::read_u16(&header[2..4]),
        BigEndian::read_u32(&header[4..8]),
        BigEndian::read_u32(&header[8..12]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtp_header_roundtrip() {
        let header = build_rtp_header(100, 48_000, 12_345);
        assert_eq!(header[0], 0x80);
        assert_eq!(header[1], 0x78);
        assert_eq!(parse_rtp_header(&header), (100, 48_000, 12_345));
    }

    #[test]
    fn seal_open_xchacha() {
        let key = [7u8; KEY_SIZE];
        let mut crypto =
            VoiceCrypto::new(&key, EncryptionMode::AeadXChaCha20Poly1305Rtpsize);
        let header = build_rtp_header(1, 960, 42);
        let opus = b"opus frame bytes";

        let packet = crypto.seal(&header, opus).unwrap();
        assert_eq!(&packet[..RTP_HEADER_SIZE], &header);
        assert_eq!(
            packet.len(),
            RTP_HEADER_SIZE + opus.len() + TAG_SIZE + NONCE_SUFFIX_SIZE
        );

        let opener = VoiceCrypto::new(&key, EncryptionMode::AeadXChaCha20Poly1305Rtpsize);
        let (got_header, got_opus) = opener.open(&packet).unwrap();
        assert_eq!(got_header, header);
        assert_eq!(got_opus, opus);
    }

    #[test]
    fn seal_open_aes_gcm() {
        let key = [9u8; KEY_SIZE];
        let mut crypto = VoiceCrypto::new(&key, EncryptionMode::AeadAes256GcmRtpsize);
        let header = build_rtp_header(2, 1920, 42);
        let opus = b"another frame";

        let packet = crypto.seal(&header, opus).unwrap();
        let opener = VoiceCrypto::new(&key, EncryptionMode::AeadAes256GcmRtpsize);
        let (_, got_opus) = opener.open(&packet).unwrap();
        assert_eq!(got_opus, opus);
    }

    #[test]
    fn tampered_header_fails_authentication() {
        let key = [1u8; KEY_SIZE];
        let mut crypto =
            VoiceCrypto::new(&key, EncryptionMode::AeadXChaCha20Poly1305Rtpsize);
        let header = build_rtp_header(1, 960, 42);
        let mut packet = crypto.seal(&header, b"frame").unwrap();

        // Flip a header bit: AAD authentication must reject the packet.
        packet[3] ^= 0x01;
        let opener = VoiceCrypto::new(&key, EncryptionMode::AeadXChaCha20Poly1305Rtpsize);
        assert!(opener.open(&packet).is_err());
    }

    #[test]
    fn counter_advances_per_packet() {
        let key = [0u8; KEY_SIZE];
        let mut crypto =
            VoiceCrypto::new(&key, EncryptionMode::AeadXChaCha20Poly1305Rtpsize);
        let header = build_rtp_header(1, 960, 42);

        let first = crypto.seal(&header, b"x").unwrap();
        let second = crypto.seal(&header, b"x").unwrap();

        let counter_of = |p: &[u8]| BigEndian::read_u32(&p[p.len() - NONCE_SUFFIX_SIZE..]);
        assert_eq!(counter_of(&first), 0);
        assert_eq!(counter_of(&second), 1);
    }
}
