//! BLIP messages: builders for outgoing messages, frame splitting and
//! reassembly, and the properties codec.
//!
//! A message's wire payload is a properties block (varint byte length, then
//! NUL-terminated name/value string pairs) followed by the body. The payload
//! is split into frames of `(MessageNo varint, flags byte, bytes...)`; every
//! frame but the last carries the `MORE_COMING` flag. A `COMPRESSED` payload
//! is deflated as a whole before framing.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use rivetdb_core::error::{Result, RivetError};
use rivetdb_core::varint;

use crate::protocol::*;

fn corrupt(what: &str) -> RivetError {
    RivetError::RemoteError {
        domain: "BLIP".into(),
        code: 400,
        message: format!("malformed message: {what}"),
    }
}

// ---------------------------------------------------------------------------
// Properties codec
// ---------------------------------------------------------------------------

pub(crate) fn encode_properties(properties: &[(String, String)]) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in properties {
        block.extend_from_slice(name.as_bytes());
        block.push(0);
        block.extend_from_slice(value.as_bytes());
        block.push(0);
    }
    let mut out = Vec::with_capacity(block.len() + 2);
    varint::put_uvarint(&mut out, block.len() as u64);
    out.extend_from_slice(&block);
    out
}

pub(crate) fn decode_properties(payload: &mut &[u8]) -> Result<Vec<(String, String)>> {
    let size = varint::read_uvarint(payload).ok_or_else(|| corrupt("properties length"))? as usize;
    if size > payload.len() {
        return Err(corrupt("properties overrun payload"));
    }
    let block = &payload[..size];
    *payload = &payload[size..];

    let mut properties = Vec::new();
    let mut strings = block.split(|&b| b == 0);
    loop {
        let Some(name) = strings.next() else { break };
        if name.is_empty() && properties.is_empty() && block.is_empty() {
            break;
        }
        let Some(value) = strings.next() else {
            if name.is_empty() {
                break; // trailing terminator
            }
            return Err(corrupt("odd property count"));
        };
        if name.is_empty() {
            break;
        }
        properties.push((
            String::from_utf8(name.to_vec()).map_err(|_| corrupt("non-UTF-8 property"))?,
            String::from_utf8(value.to_vec()).map_err(|_| corrupt("non-UTF-8 property"))?,
        ));
    }
    Ok(properties)
}

// ---------------------------------------------------------------------------
// MessageBuilder
// ---------------------------------------------------------------------------

/// Builds an outgoing request or response.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    pub urgent: bool,
    pub compressed: bool,
    pub no_reply: bool,
    message_type: Option<MessageType>, // None = Request
    properties: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MessageBuilder {
    pub fn request() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Shorthand for a request with a `Profile` property.
    pub fn with_profile(profile: &str) -> MessageBuilder {
        let mut builder = MessageBuilder::request();
        builder.add_property(PROFILE_PROPERTY, profile);
        builder
    }

    pub fn add_property(&mut self, name: &str, value: &str) -> &mut Self {
        self.properties.push((name.to_string(), value.to_string()));
        self
    }

    pub fn add_int_property(&mut self, name: &str, value: i64) -> &mut Self {
        self.add_property(name, &value.to_string())
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.body.extend_from_slice(bytes);
        self
    }

    /// Turns the message into an error response.
    pub fn make_error(&mut self, domain: &str, code: i32, message: &str) -> &mut Self {
        self.message_type = Some(MessageType::Error);
        self.add_property(ERROR_DOMAIN_PROPERTY, domain);
        self.add_int_property(ERROR_CODE_PROPERTY, i64::from(code));
        self.body = message.as_bytes().to_vec();
        self
    }

    pub(crate) fn make_response(&mut self) {
        if self.message_type.is_none() {
            self.message_type = Some(MessageType::Response);
        }
    }

    pub(crate) fn build(self, number: MessageNo) -> Result<MessageOut> {
        let message_type = self.message_type.unwrap_or(MessageType::Request);
        let mut flags = message_type as u8;
        if self.urgent {
            flags |= URGENT;
        }
        if self.no_reply {
            flags |= NO_REPLY;
        }
        let mut payload = encode_properties(&self.properties);
        payload.extend_from_slice(&self.body);
        if self.compressed {
            flags |= COMPRESSED;
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            payload = encoder.finish()?;
        }
        Ok(MessageOut::new(flags, number, payload))
    }
}

// ---------------------------------------------------------------------------
// MessageOut
// ---------------------------------------------------------------------------

/// An outgoing message being framed onto the wire.
#[derive(Debug)]
pub struct MessageOut {
    pub flags: u8,
    pub number: MessageNo,
    payload: Vec<u8>,
    offset: usize,
    /// Payload bytes sent but not yet acked by the peer.
    pub unacked: u64,
    bytes_sent: u64,
}

impl MessageOut {
    pub(crate) fn new(flags: u8, number: MessageNo, payload: Vec<u8>) -> MessageOut {
        MessageOut {
            flags,
            number,
            payload,
            offset: 0,
            unacked: 0,
            bytes_sent: 0,
        }
    }

    /// An ack message crediting `received` bytes of message `number`.
    pub(crate) fn ack(of_type: MessageType, number: MessageNo, received: u64) -> MessageOut {
        let mut body = Vec::new();
        varint::put_uvarint(&mut body, received);
        MessageOut::new(of_type as u8 | URGENT | NO_REPLY, number, body)
    }

    pub fn message_type(&self) -> MessageType {
        MessageType::from_bits(self.flags).expect("built with a valid type")
    }

    pub fn is_urgent(&self) -> bool {
        self.flags & URGENT != 0
    }

    pub fn no_reply(&self) -> bool {
        self.flags & NO_REPLY != 0
    }

    pub fn finished(&self) -> bool {
        self.offset >= self.payload.len()
    }

    pub fn is_paused(&self) -> bool {
        self.unacked >= MAX_UNACKED_BYTES
    }

    pub(crate) fn handle_ack(&mut self, received: u64) {
        self.unacked = self.bytes_sent.saturating_sub(received);
    }

    /// Produces the next frame, up to `max_payload` payload bytes.
    pub(crate) fn next_frame(&mut self, max_payload: usize) -> Vec<u8> {
        let remaining = &self.payload[self.offset..];
        let chunk = remaining.len().min(max_payload);
        let last = chunk == remaining.len();

        let mut flags = self.flags & !MORE_COMING;
        if !last {
            flags |= MORE_COMING;
        }
        let mut frame = Vec::with_capacity(chunk + 11);
        varint::put_uvarint(&mut frame, self.number);
        frame.push(flags);
        frame.extend_from_slice(&remaining[..chunk]);

        self.offset += chunk;
        self.bytes_sent += chunk as u64;
        if !self.message_type().is_ack() {
            self.unacked += chunk as u64;
        }
        frame
    }
}

// ---------------------------------------------------------------------------
// MessageIn
// ---------------------------------------------------------------------------

/// A fully received message.
#[derive(Debug, Clone)]
pub struct MessageIn {
    pub flags: u8,
    pub number: MessageNo,
    properties: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MessageIn {
    pub fn message_type(&self) -> MessageType {
        MessageType::from_bits(self.flags).unwrap_or(MessageType::Error)
    }

    pub fn is_error(&self) -> bool {
        self.message_type() == MessageType::Error
    }

    pub fn no_reply(&self) -> bool {
        self.flags & NO_REPLY != 0
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn int_property(&self, name: &str, default: i64) -> i64 {
        self.property(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn profile(&self) -> Option<&str> {
        self.property(PROFILE_PROPERTY)
    }

    /// Converts an error response into the local error taxonomy.
    pub fn as_error(&self) -> Option<RivetError> {
        if !self.is_error() {
            return None;
        }
        Some(RivetError::RemoteError {
            domain: self
                .property(ERROR_DOMAIN_PROPERTY)
                .unwrap_or("BLIP")
                .to_string(),
            code: self.int_property(ERROR_CODE_PROPERTY, 0) as i32,
            message: String::from_utf8_lossy(&self.body).into_owned(),
        })
    }
}

/// Reassembles one message from its frames.
#[derive(Debug)]
pub(crate) struct MessageInProgress {
    pub flags: u8,
    pub number: MessageNo,
    buffer: Vec<u8>,
    /// Payload bytes received and not yet acked back to the sender.
    pub unacked: u64,
    pub bytes_received: u64,
}

impl MessageInProgress {
    pub(crate) fn new(flags: u8, number: MessageNo) -> MessageInProgress {
        MessageInProgress {
            flags,
            number,
            buffer: Vec::new(),
            unacked: 0,
            bytes_received: 0,
        }
    }

    /// Appends one frame's payload. Returns the finished message when this
    /// was the final frame.
    pub(crate) fn receive_frame(
        &mut self,
        flags: u8,
        payload: &[u8],
    ) -> Result<Option<MessageIn>> {
        self.flags = flags; // later frames win, minus MORE_COMING below
        self.buffer.extend_from_slice(payload);
        self.unacked += payload.len() as u64;
        self.bytes_received += payload.len() as u64;
        if flags & MORE_COMING != 0 {
            return Ok(None);
        }

        let payload = if flags & COMPRESSED != 0 {
            let mut decoder = DeflateDecoder::new(self.buffer.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|_| corrupt("bad deflate data"))?;
            out
        } else {
            std::mem::take(&mut self.buffer)
        };

        let mut rest = payload.as_slice();
        let properties = decode_properties(&mut rest)?;
        Ok(Some(MessageIn {
            flags: (self.flags & !MORE_COMING) & !COMPRESSED,
            number: self.number,
            properties,
            body: rest.to_vec(),
        }))
    }
}

/// Splits a raw frame into `(message number, flags, payload)`.
pub(crate) fn parse_frame(frame: &[u8]) -> Result<(MessageNo, u8, &[u8])> {
    let mut rest = frame;
    let number = varint::read_uvarint(&mut rest).ok_or_else(|| corrupt("frame number"))?;
    let (&flags, payload) = rest.split_first().ok_or_else(|| corrupt("frame flags"))?;
    Ok((number, flags, payload))
}
