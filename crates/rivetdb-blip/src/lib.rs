//! BLIP: a bidirectional, multiplexed request/response protocol carried as
//! frames over a single transport. Large messages are split into frames so
//! they never starve small ones; urgent messages are scheduled ahead;
//! receivers credit senders with acks for flow control; payloads may be
//! deflate-compressed.

pub mod connection;
pub mod message;
pub mod protocol;
pub mod transport;

pub use connection::{Connection, Responder};
pub use message::{MessageBuilder, MessageIn};
pub use protocol::{MessageNo, MessageType, PROFILE_PROPERTY, WS_PROTOCOL_NAME};
pub use transport::{LoopbackTransport, StreamTransport, Transport, loopback};
