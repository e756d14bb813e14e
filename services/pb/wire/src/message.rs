//! The logical message carried by one frame.
//!
//! A message is addressed either to a named protocol on the remote endpoint
//! (requests and replies) or to the remote endpoint's event listeners
//! (events). The payload is opaque to this crate.

use bytes::Bytes;
use std::fmt;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Message kinds as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Request addressed to a protocol
    Request = 0x00,
    /// Reply addressed to a protocol
    Reply = 0x01,
    /// Named event for the remote listeners
    Event = 0x02,
}

impl TryFrom<u8> for MessageKind {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(MessageKind::Request),
            0x01 => Ok(MessageKind::Reply),
            0x02 => Ok(MessageKind::Event),
            _ => Err(crate::WireError::Kind(value)),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Request => write!(f, "request"),
            MessageKind::Reply => write!(f, "reply"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// One logical message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    protocol: String,
    name: String,
    payload: Bytes,
}

impl Message {
    /// Build a request for `protocol` of the given message type
    pub fn request(protocol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Request,
            protocol: protocol.into(),
            name: name.into(),
            payload: Bytes::new(),
        }
    }

    /// Build a reply for `protocol` of the given message type
    pub fn reply(protocol: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Reply,
            protocol: protocol.into(),
            name: name.into(),
            payload: Bytes::new(),
        }
    }

    /// Build a named event with a payload
    pub fn event(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Event,
            protocol: String::new(),
            name: name.into(),
            payload: payload.into(),
        }
    }

    pub(crate) fn from_parts(kind: MessageKind, protocol: String, name: String, payload: Bytes) -> Self {
        Self {
            kind,
            protocol,
            name,
            payload,
        }
    }

    /// Attach a payload
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Message kind
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Protocol the message belongs to (empty for events)
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Message type for protocol messages, event name for events
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether this message is a protocol request of the given type
    pub fn is_request(&self, name: &str) -> bool {
        self.kind == MessageKind::Request && self.name == name
    }

    /// Whether this message is a protocol reply of the given type
    pub fn is_reply(&self, name: &str) -> bool {
        self.kind == MessageKind::Reply && self.name == name
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::Event => write!(f, "event {} ({} bytes)", self.name, self.payload.len()),
            kind => write!(f, "{} {}/{}", kind, self.protocol, self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_conversion() {
        assert_eq!(MessageKind::try_from(0x01).unwrap(), MessageKind::Reply);
        assert!(matches!(
            MessageKind::try_from(0x07),
            Err(crate::WireError::Kind(0x07))
        ));
    }

    #[test]
    fn test_message_predicates() {
        let msg = Message::request("SessionProtocol", "SessionStartRequest");
        assert!(msg.is_request("SessionStartRequest"));
        assert!(!msg.is_reply("SessionStartRequest"));
        assert_eq!(msg.to_string(), "request SessionProtocol/SessionStartRequest");

        let event = Message::event("GET_FILE", "notes.txt");
        assert_eq!(event.protocol(), "");
        assert_eq!(event.payload().as_ref(), b"notes.txt");
    }
}
