//! CBOR metadata helpers for the wire protocol.
//!
//! The metadata section of each frame is a canonical CBOR map with text keys.
//! It carries the protocol name and message type so that the payload stays
//! opaque.

use crate::WireError;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Metadata key holding the protocol name
pub const META_PROTOCOL: &str = "protocol";
/// Metadata key holding the message type or event name
pub const META_TYPE: &str = "type";

/// CBOR metadata builder helper
#[derive(Debug, Clone)]
pub struct MetaBuilder {
    map: BTreeMap<String, ciborium::Value>,
}

impl MetaBuilder {
    /// Create a new metadata builder
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a string value
    pub fn insert_str(mut self, key: &str, value: &str) -> Self {
        self.map
            .insert(key.to_string(), ciborium::Value::Text(value.to_string()));
        self
    }

    /// Build the metadata as CBOR bytes
    pub fn build(self) -> Result<Bytes, WireError> {
        let value = ciborium::Value::Map(
            self.map
                .into_iter()
                .map(|(k, v)| (ciborium::Value::Text(k), v))
                .collect(),
        );

        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).map_err(|_| WireError::MetaEncode)?;

        Ok(Bytes::from(buf))
    }
}

impl Default for MetaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse CBOR metadata into a map
pub fn parse_meta(meta_raw: &[u8]) -> Result<BTreeMap<String, ciborium::Value>, WireError> {
    let value: ciborium::Value = ciborium::from_reader(meta_raw).map_err(|_| WireError::Meta)?;

    if let ciborium::Value::Map(map) = value {
        let mut result = BTreeMap::new();
        for (key, value) in map {
            if let ciborium::Value::Text(key_str) = key {
                result.insert(key_str, value);
            }
        }
        Ok(result)
    } else {
        Err(WireError::Meta)
    }
}

/// Get string value from metadata
pub fn get_meta_str(meta: &BTreeMap<String, ciborium::Value>, key: &str) -> Option<String> {
    meta.get(key).and_then(|v| {
        if let ciborium::Value::Text(s) = v {
            Some(s.clone())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_builder() {
        let meta = MetaBuilder::new()
            .insert_str(META_PROTOCOL, "KeepAliveProtocol")
            .insert_str(META_TYPE, "KeepAliveRequest")
            .build()
            .unwrap();

        let parsed = parse_meta(&meta).unwrap();
        assert_eq!(
            get_meta_str(&parsed, META_PROTOCOL),
            Some("KeepAliveProtocol".to_string())
        );
        assert_eq!(
            get_meta_str(&parsed, META_TYPE),
            Some("KeepAliveRequest".to_string())
        );
        assert_eq!(get_meta_str(&parsed, "missing"), None);
    }

    #[test]
    fn test_meta_rejects_non_map() {
        let mut buf = Vec::new();
        ciborium::into_writer(&ciborium::Value::Text("nope".into()), &mut buf).unwrap();
        assert_eq!(parse_meta(&buf), Err(WireError::Meta));
        assert_eq!(parse_meta(&[0xff, 0x00]), Err(WireError::Meta));
    }
}
