//! Blake3 fingerprints of run inputs and drained traces.
//!
//! Two runs of the same input and seed produce the same config hash and the
//! same trace hash; comparing them is how a replay is checked. The same
//! digests key the per-component random streams.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A 32-byte Blake3 digest, shown and serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    const HEX_LEN: usize = 64;

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Digest of `parts` fed in order, without separators.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut stream = HashStream::new();
        for part in parts {
            stream.update(part);
        }
        stream.finish()
    }

    pub fn from_hex(text: &str) -> Result<Self, HexError> {
        if text.len() != Self::HEX_LEN {
            return Err(HexError::InvalidLength {
                expected: Self::HEX_LEN,
                actual: text.len(),
            });
        }
        let mut digest = [0u8; 32];
        hex::decode_to_slice(text, &mut digest).map_err(|_| HexError::InvalidHex)?;
        Ok(Self(digest))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The first eight bytes, little-endian. Used as a seed word.
    pub fn as_u64(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(word)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "Hash({}..)", &hex[..12])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// Running digest over a sequence of records, such as every drained event.
#[derive(Debug, Clone, Default)]
pub struct HashStream(blake3::Hasher);

impl HashStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Digest of everything fed so far. The stream stays usable.
    pub fn finish(&self) -> Hash {
        Hash(*self.0.finalize().as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HexError {
    #[error("hash must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("hash contains non-hex characters")]
    InvalidHex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_matches_parts() {
        let mut stream = HashStream::new();
        stream.update(b"event-1");
        stream.update(b"event-2");
        assert_eq!(stream.finish(), Hash::from_parts(&[b"event-1", b"event-2"]));
        assert_eq!(stream.finish(), Hash::from_bytes(b"event-1event-2"));
    }

    #[test]
    fn test_part_order_matters() {
        assert_ne!(
            Hash::from_parts(&[b"a", b"b"]),
            Hash::from_parts(&[b"b", b"a"])
        );
    }

    #[test]
    fn test_hex_and_serde() {
        let digest = Hash::from_bytes(b"checkout-v2");
        let text = digest.to_hex();
        assert_eq!(Hash::from_hex(&text), Ok(digest));
        assert_eq!(
            Hash::from_hex("abc"),
            Err(HexError::InvalidLength {
                expected: 64,
                actual: 3
            })
        );
        assert_eq!(Hash::from_hex(&"zz".repeat(32)), Err(HexError::InvalidHex));

        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{text}\""));
        assert_eq!(serde_json::from_str::<Hash>(&json).unwrap(), digest);
    }

    #[test]
    fn test_seed_word_is_stable() {
        assert_eq!(
            Hash::from_bytes(b"seed").as_u64(),
            Hash::from_bytes(b"seed").as_u64()
        );
        assert_ne!(
            Hash::from_bytes(b"seed").as_u64(),
            Hash::from_bytes(b"other").as_u64()
        );
    }
}
