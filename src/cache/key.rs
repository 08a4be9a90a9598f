//! Fixed-size content keys.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Length of a [`Key`] in bytes.
pub const KEY_LEN: usize = 16;

/// A fixed-size content identifier.
///
/// Keys are the 16-byte content hash of an object path, computed by the
/// protocol layer and handed to the engine already decoded. They index the
/// meta index and feed group filters; immutable once created.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key([u8; KEY_LEN]);

impl Key {
    /// Parse a key from its 32-character hex form (e.g. an MD5 digest taken
    /// from a request path).
    pub fn from_hex(s: &str) -> Result<Self, CacheError> {
        let bytes = hex::decode(s).map_err(|_| CacheError::InvalidKey(s.to_string()))?;
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CacheError::InvalidKey(s.to_string()))?;
        Ok(Self(arr))
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl From<[u8; KEY_LEN]> for Key {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
        assert_eq!(key.to_string(), "00112233445566778899aabbccddeeff");
        assert_eq!(key.as_bytes()[0], 0x00);
        assert_eq!(key.as_bytes()[15], 0xff);
    }

    #[test]
    fn test_rejects_bad_hex() {
        assert!(Key::from_hex("not hex at all").is_err());
        // Right charset, wrong length.
        assert!(Key::from_hex("0011223344").is_err());
        assert!(Key::from_hex("00112233445566778899aabbccddeeff00").is_err());
    }

    #[test]
    fn test_ordering_is_bytewise() {
        let a = Key::from([0u8; KEY_LEN]);
        let b = Key::from([1u8; KEY_LEN]);
        assert!(a < b);
        assert_eq!(a, Key::from([0u8; KEY_LEN]));
    }
}
