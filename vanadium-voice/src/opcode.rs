//! Voice gateway opcodes.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Voice gateway operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum VoiceOpCode {
    /// Begin a voice session. Send.
    Identify = 0,
    /// Select the voice protocol. Send.
    SelectProtocol = 1,
    /// Response to Identify: SSRC, address, supported modes. Receive.
    Ready = 2,
    /// Keep the connection alive. Send.
    Heartbeat = 3,
    /// Response to SelectProtocol: the secret key. Receive.
    SessionDescription = 4,
    /// Indicate speaking state. Send/Receive.
    Speaking = 5,
    /// Acknowledgment of a heartbeat. Receive.
    HeartbeatAck = 6,
    /// Resume a dropped voice session. Send.
    Resume = 7,
    /// Heartbeat interval. Receive.
    Hello = 8,
    /// Resume acknowledged. Receive.
    Resumed = 9,
    /// A client disconnected from the channel. Receive.
    ClientDisconnect = 13,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_serialization() {
        assert_eq!(serde_json::to_string(&VoiceOpCode::Hello).unwrap(), "8");
        let op: VoiceOpCode = serde_json::from_str("8").unwrap();
        assert_eq!(op, VoiceOpCode::Hello);
    }
}
