//! Canonical CBOR helpers.
//!
//! Every byte string that gets hashed or signed goes through [`encode`], so
//! two peers serializing the same value always produce the same bytes.

use serde::{Serialize, de::DeserializeOwned};

use crate::errors::{ProtocolError, Result};

/// Serialize a value to CBOR.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_deterministic() {
        let value = std::collections::BTreeMap::from([("b", 2u32), ("a", 1u32)]);
        assert_eq!(encode(&value).unwrap(), encode(&value).unwrap());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let bytes = encode(&("hello", 42u64)).unwrap();
        let result: Result<(String, u64)> = decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }
}
