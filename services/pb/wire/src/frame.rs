//! Message framing for the wire protocol.
//!
//! Each message travels in one length-prefixed frame so that partial socket
//! reads can be reassembled by [`MessageDecoder`].

use crate::codec::{get_meta_str, parse_meta, MetaBuilder, META_PROTOCOL, META_TYPE};
use crate::message::{Message, MessageKind, WIRE_VERSION};
use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Maximum frame size (16 MiB default, 64 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum metadata size (64 KiB)
pub const MAX_META_SIZE: usize = 64 * 1024;

/// Bytes preceding the metadata inside a frame: version, kind, meta_len
const FIXED_HEADER_SIZE: usize = 1 + 1 + 4;

/// Addressing rules shared by both directions: a non-empty type, a protocol
/// name on requests and replies, none on events
fn check_addressing(kind: MessageKind, protocol: &str, name: &str) -> Result<(), WireError> {
    if name.is_empty() {
        return Err(WireError::Malformed("empty message type"));
    }
    match kind {
        MessageKind::Request | MessageKind::Reply if protocol.is_empty() => {
            Err(WireError::Malformed("protocol message without protocol name"))
        }
        MessageKind::Event if !protocol.is_empty() => {
            Err(WireError::Malformed("event addressed to a protocol"))
        }
        _ => Ok(()),
    }
}

/// Encode a message into one contiguous frame.
///
/// Messages the decoder would reject are refused here, so a bad address
/// stays a local error instead of closing the remote side.
pub fn encode(message: &Message, max_frame_size: usize) -> Result<Bytes, WireError> {
    check_addressing(message.kind(), message.protocol(), message.name())?;

    let meta_raw = MetaBuilder::new()
        .insert_str(META_PROTOCOL, message.protocol())
        .insert_str(META_TYPE, message.name())
        .build()?;

    if meta_raw.len() > MAX_META_SIZE {
        return Err(WireError::Size(meta_raw.len()));
    }

    let frame_len = FIXED_HEADER_SIZE + meta_raw.len() + message.payload().len();
    let total_size = 4 + frame_len;
    if total_size > max_frame_size.min(HARD_MAX_FRAME_SIZE) {
        return Err(WireError::Size(total_size));
    }

    let mut buf = BytesMut::with_capacity(total_size);

    // Frame length (everything after this u32)
    buf.put_u32(frame_len as u32);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(message.kind() as u8);

    // Metadata
    buf.put_u32(meta_raw.len() as u32);
    buf.put_slice(&meta_raw);

    // Payload
    buf.put_slice(message.payload());

    Ok(buf.freeze())
}

/// Decoder for parsing incoming frames
#[derive(Debug)]
pub struct MessageDecoder {
    max_frame_size: usize,
}

impl MessageDecoder {
    /// Create a new decoder with the default size limit
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder that refuses frames above `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one message from a buffer.
    ///
    /// Returns `Ok(None)` while the buffer holds less than a full frame. A
    /// decoded frame is removed from the buffer, leaving the remainder.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        // Peek at frame length
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        // Check frame size limits
        if frame_len.saturating_add(4) > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }
        if frame_len < FIXED_HEADER_SIZE {
            return Err(WireError::Malformed("frame shorter than header"));
        }

        // Check if we have the complete frame
        if buf.len() < 4 + frame_len {
            trace!("Partial frame: have {} of {} bytes", buf.len(), 4 + frame_len);
            return Ok(None);
        }

        // Skip the frame length field
        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();

        let version = frame_buf.get_u8();
        if version != WIRE_VERSION {
            return Err(WireError::Version(version));
        }
        let kind = MessageKind::try_from(frame_buf.get_u8())?;

        let meta_len = frame_buf.get_u32() as usize;
        if meta_len > MAX_META_SIZE || frame_buf.len() < meta_len {
            return Err(WireError::Meta);
        }
        let meta_raw = frame_buf.split_to(meta_len);
        let meta = parse_meta(&meta_raw)?;

        let protocol = get_meta_str(&meta, META_PROTOCOL).ok_or(WireError::Meta)?;
        let name = get_meta_str(&meta, META_TYPE).ok_or(WireError::Meta)?;

        check_addressing(kind, &protocol, &name)?;

        // Remaining bytes are payload
        Ok(Some(Message::from_parts(kind, protocol, name, frame_buf)))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn decode_all(bytes: &[u8]) -> Result<Vec<Message>, WireError> {
        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(msg) = decoder.decode(&mut buf)? {
            out.push(msg);
        }
        Ok(out)
    }

    #[test]
    fn test_partial_frames_reassemble() {
        let first = encode(&Message::request("SessionProtocol", "SessionStartRequest"), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let second = encode(&Message::event("WHITEBOARD_UPDATE", "board%1:path"), DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut stream = BytesMut::new();
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&second);
        let all = stream.freeze();

        let mut decoder = MessageDecoder::new();
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();
        // Feed one byte at a time to simulate short reads
        for byte in all.iter() {
            buf.put_u8(*byte);
            while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                decoded.push(msg);
            }
        }

        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_request("SessionStartRequest"));
        assert_eq!(decoded[1].name(), "WHITEBOARD_UPDATE");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bad_version_is_invalid() {
        let mut frame = BytesMut::from(
            encode(&Message::reply("KeepAliveProtocol", "KeepAliveReply"), DEFAULT_MAX_FRAME_SIZE)
                .unwrap()
                .as_ref(),
        );
        frame[4] = 9;
        assert_eq!(decode_all(&frame), Err(WireError::Version(9)));
    }

    #[test]
    fn test_oversized_frame_is_refused() {
        let decoder_limit = 1024;
        let mut decoder = MessageDecoder::with_max_frame_size(decoder_limit);
        let mut buf = BytesMut::new();
        buf.put_u32(4096);
        assert_eq!(decoder.decode(&mut buf), Err(WireError::Size(4096)));

        let big = Message::event("FILE_CONTENTS", vec![0u8; 2048]);
        assert!(matches!(encode(&big, decoder_limit), Err(WireError::Size(_))));
    }

    #[test]
    fn test_unaddressable_messages_are_refused() {
        let refused = [
            Message::event("", "x"),
            Message::request("", "Orphan"),
            Message::reply("", "Orphan"),
            Message::request("SessionProtocol", ""),
            Message::from_parts(MessageKind::Event, "SessionProtocol".into(), "x".into(), Bytes::new()),
        ];
        for msg in &refused {
            assert!(
                matches!(encode(msg, DEFAULT_MAX_FRAME_SIZE), Err(WireError::Malformed(_))),
                "{} was encoded",
                msg
            );
        }
    }

    #[test]
    fn test_request_without_protocol_is_malformed() {
        // Built by hand: encode refuses to produce this frame
        let meta = MetaBuilder::new()
            .insert_str(META_PROTOCOL, "")
            .insert_str(META_TYPE, "Orphan")
            .build()
            .unwrap();
        let mut frame = BytesMut::new();
        frame.put_u32((FIXED_HEADER_SIZE + meta.len()) as u32);
        frame.put_u8(WIRE_VERSION);
        frame.put_u8(MessageKind::Request as u8);
        frame.put_u32(meta.len() as u32);
        frame.put_slice(&meta);

        assert_eq!(
            decode_all(&frame),
            Err(WireError::Malformed("protocol message without protocol name"))
        );
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        let payload = proptest::collection::vec(any::<u8>(), 0..512);
        prop_oneof![
            ("[A-Za-z]{1,24}", "[A-Za-z]{1,24}", payload.clone())
                .prop_map(|(p, n, body)| Message::request(p, n).with_payload(body)),
            ("[A-Za-z]{1,24}", "[A-Za-z]{1,24}", payload.clone())
                .prop_map(|(p, n, body)| Message::reply(p, n).with_payload(body)),
            ("[A-Z_]{1,24}", payload).prop_map(|(n, body)| Message::event(n, body)),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_recovers_encoded(msg in arb_message()) {
            let frame = encode(&msg, DEFAULT_MAX_FRAME_SIZE).unwrap();
            let decoded = decode_all(&frame).unwrap();
            prop_assert_eq!(decoded, vec![msg]);
        }

        #[test]
        fn prop_garbage_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            // Either a clean error, a need-more-data result, or well-formed messages
            let _ = decode_all(&bytes);
        }

        #[test]
        fn prop_corrupted_header_is_reported(msg in arb_message(), kind in 3u8..=255) {
            let mut frame = BytesMut::from(encode(&msg, DEFAULT_MAX_FRAME_SIZE).unwrap().as_ref());
            frame[5] = kind;
            prop_assert_eq!(decode_all(&frame), Err(WireError::Kind(kind)));
        }
    }
}
