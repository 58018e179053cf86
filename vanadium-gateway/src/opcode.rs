//! Discord Gateway opcodes.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Gateway operation codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-opcodes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched. Receive.
    Dispatch = 0,

    /// Keep the connection alive. Send/Receive.
    Heartbeat = 1,

    /// Start a new session. Send.
    Identify = 2,

    /// Update the client's presence. Send.
    PresenceUpdate = 3,

    /// Join/leave/move between voice channels. Send.
    VoiceStateUpdate = 4,

    /// Resume a previous session. Send.
    Resume = 6,

    /// Server requested a reconnect. Receive.
    Reconnect = 7,

    /// Request guild member chunks. Send.
    RequestGuildMembers = 8,

    /// Session has been invalidated. Receive.
    InvalidSession = 9,

    /// Sent after connecting, contains the heartbeat interval. Receive.
    Hello = 10,

    /// Acknowledgment of a heartbeat. Receive.
    HeartbeatAck = 11,
}

impl OpCode {
    /// Whether this opcode only ever arrives from the server.
    pub const fn is_receive_only(self) -> bool {
        matches!(
            self,
            OpCode::Dispatch
                | OpCode::Reconnect
                | OpCode::InvalidSession
                | OpCode::Hello
                | OpCode::HeartbeatAck
        )
    }

    /// Whether this opcode only ever goes to the server.
    pub const fn is_send_only(self) -> bool {
        matches!(
            self,
            OpCode::Identify
                | OpCode::PresenceUpdate
                | OpCode::VoiceStateUpdate
                | OpCode::Resume
                | OpCode::RequestGuildMembers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_serialization() {
        assert_eq!(serde_json::to_string(&OpCode::Hello).unwrap(), "10");
        let opcode: OpCode = serde_json::from_str("10").unwrap();
        assert_eq!(opcode, OpCode::Hello);
    }

    #[test]
    fn opcode_direction() {
        assert!(OpCode::Dispatch.is_receive_only());
        assert!(OpCode::Identify.is_send_only());
        assert!(!OpCode::Heartbeat.is_receive_only());
        assert!(!OpCode::Heartbeat.is_send_only());
    }
}
