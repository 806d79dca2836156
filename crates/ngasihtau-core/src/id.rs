//! Opaque 128-bit identifiers with a canonical lowercase-hex form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtectionError;

/// An opaque 128-bit identifier.
///
/// Generated with UUIDv4 semantics (16 random bytes), passed by value, and
/// rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id([u8; 16]);

impl Id {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(*uuid::Uuid::new_v4().as_bytes())
    }

    /// The all-zero identifier.
    pub const fn nil() -> Self {
        Self([0u8; 16])
    }

    /// Returns true for the all-zero identifier.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Builds an identifier from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Raw byte view, used to build key-derivation info strings.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the canonical 32-character hex form.
    pub fn parse(s: &str) -> Result<Self, ProtectionError> {
        let raw = hex::decode(s).map_err(|_| ProtectionError::InvalidRequest {
            reason: format!("malformed identifier: {:?}", s),
        })?;
        let bytes: [u8; 16] = raw.try_into().map_err(|_| ProtectionError::InvalidRequest {
            reason: format!("identifier has wrong length: {:?}", s),
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = ProtectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(Id::generate(), Id::generate());
    }

    #[test]
    fn test_display_is_32_hex_chars() {
        let id = Id::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_parse_roundtrip() {
        let id = Id::generate();
        assert_eq!(Id::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert!(Id::parse("abcd").is_err());
    }

    #[test]
    fn test_parse_rejects_non_hex() {
        assert!(Id::parse("zz000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_nil() {
        assert!(Id::nil().is_nil());
        assert!(!Id::generate().is_nil());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = Id::from_bytes([0xab; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(16)));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
