//! Message framing and encoding/decoding for pb endpoints.
//!
//! This crate turns one logical [`Message`] into one frame on a reliable byte
//! stream and back again. Partial reads are reassembled by the
//! [`MessageDecoder`]; malformed input is always reported as a [`WireError`]
//! so the owner of the stream can close it deterministically.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 version           | WIRE_VERSION               |
//! +----------------------+----------------------------+
//! | u8 kind              | request / reply / event    |
//! +----------------------+----------------------------+
//! | u32 meta_len         | canonical CBOR map length  |
//! +----------------------+----------------------------+
//! | meta_bytes           | {"protocol", "type"}       |
//! +----------------------+----------------------------+
//! | payload              | variable (0..N), opaque    |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

// Re-export main types
pub use codec::{get_meta_str, parse_meta, MetaBuilder, META_PROTOCOL, META_TYPE};
pub use error::WireError;
pub use frame::{
    encode, MessageDecoder, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE, MAX_META_SIZE,
};
pub use message::{Message, MessageKind, WIRE_VERSION};
