//! Provides `Decoded`, a byte-vector wrapper that (de)serializes through a textual encoding
//! instead of JSON's native array-of-numbers form. TUF metadata represents key IDs, signatures,
//! and hash digests as lowercase hex strings; `Decoded<Hex>` carries the decoded bytes while still
//! serializing back to exactly that form.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// A marker trait for a textual encoding that `Decoded` can transcode through.
pub trait Format {
    /// Decodes `s` into raw bytes.
    fn decode(s: &str) -> Result<Vec<u8>, String>;
    /// Encodes `bytes` into the textual form.
    fn encode(bytes: &[u8]) -> String;
}

/// Lowercase hexadecimal (base16) encoding, used for key IDs, signatures, and hash digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hex;

impl Format for Hex {
    fn decode(s: &str) -> Result<Vec<u8>, String> {
        hex::decode(s).map_err(|e| e.to_string())
    }

    fn encode(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }
}

/// A byte vector that serializes as a textual encoding `F` rather than a JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Decoded<F> {
    bytes: Vec<u8>,
    _format: std::marker::PhantomData<F>,
}

impl<F> Decoded<F> {
    /// Consumes this value, returning the underlying bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.bytes
    }
}

impl<F> From<Vec<u8>> for Decoded<F> {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            _format: std::marker::PhantomData,
        }
    }
}

impl<F> Deref for Decoded<F> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<F> DerefMut for Decoded<F> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl<F> AsRef<[u8]> for Decoded<F> {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<F: Format> Serialize for Decoded<F> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&F::encode(&self.bytes))
    }
}

impl<'de, F: Format> Deserialize<'de> for Decoded<F> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct Visitor<F>(std::marker::PhantomData<F>);

        impl<'de, F: Format> serde::de::Visitor<'de> for Visitor<F> {
            type Value = Decoded<F>;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a string in the expected encoding")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                F::decode(v).map(Decoded::from).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(Visitor(std::marker::PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_hex() {
        let decoded: Decoded<Hex> = vec![0xDE, 0xAD, 0xBE, 0xEF].into();
        let json = serde_json::to_string(&decoded).unwrap();
        assert_eq!(json, "\"deadbeef\"");
        let back: Decoded<Hex> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, decoded);
    }

    #[test]
    fn rejects_invalid_hex() {
        let result: Result<Decoded<Hex>, _> = serde_json::from_str("\"not hex!\"");
        assert!(result.is_err());
    }
}
