//! Wire-level constants of the BLIP framing protocol.

/// Per-side monotonically increasing message number.
pub type MessageNo = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    AckRequest = 4,
    AckResponse = 5,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> Option<MessageType> {
        match bits & TYPE_MASK {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Error),
            4 => Some(MessageType::AckRequest),
            5 => Some(MessageType::AckResponse),
            _ => None,
        }
    }

    /// The ack type for a message of this type.
    pub fn ack_type(self) -> Option<MessageType> {
        match self {
            MessageType::Request => Some(MessageType::AckRequest),
            MessageType::Response | MessageType::Error => Some(MessageType::AckResponse),
            _ => None,
        }
    }

    pub fn is_ack(self) -> bool {
        matches!(self, MessageType::AckRequest | MessageType::AckResponse)
    }

    pub fn is_response(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }
}

// Frame flag bits. The low three bits carry the message type.
pub const TYPE_MASK: u8 = 0x07;
pub const COMPRESSED: u8 = 0x08;
pub const URGENT: u8 = 0x10;
pub const NO_REPLY: u8 = 0x20;
pub const MORE_COMING: u8 = 0x40; // frames only, never whole messages
pub const META: u8 = 0x80;

/// Regular frame payload size.
pub const DEFAULT_FRAME_SIZE: usize = 4096;
/// Frame size once a message has the channel to itself (or is urgent).
pub const BIG_FRAME_SIZE: usize = 16384;

/// The receiver acks every this-many received payload bytes.
pub const ACK_INTERVAL: u64 = 50_000;
/// A sender pauses a message once this many of its bytes are unacked.
pub const MAX_UNACKED_BYTES: u64 = 128_000;

/// Subprotocol name advertised in the WebSocket handshake.
pub const WS_PROTOCOL_NAME: &str = "BLIP_3";

/// Properties of an error response.
pub const ERROR_DOMAIN_PROPERTY: &str = "Error-Domain";
pub const ERROR_CODE_PROPERTY: &str = "Error-Code";
/// Property naming the handler a request is dispatched to.
pub const PROFILE_PROPERTY: &str = "Profile";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_bits_roundtrip() {
        for t in [
            MessageType::Request,
            MessageType::Response,
            MessageType::Error,
            MessageType::AckRequest,
            MessageType::AckResponse,
        ] {
            assert_eq!(MessageType::from_bits(t as u8 | URGENT | COMPRESSED), Some(t));
        }
        assert_eq!(MessageType::from_bits(3), None);
    }

    #[test]
    fn ack_types() {
        assert_eq!(MessageType::Request.ack_type(), Some(MessageType::AckRequest));
        assert_eq!(MessageType::Response.ack_type(), Some(MessageType::AckResponse));
        assert_eq!(MessageType::AckRequest.ack_type(), None);
        assert!(MessageType::AckResponse.is_ack());
        assert!(MessageType::Error.is_response());
    }
}
