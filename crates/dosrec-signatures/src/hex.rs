//! Hex encoding of module code bytes.

use crate::{LibraryError, Result};

/// Parses a hex string. Whitespace between bytes is ignored.
///
/// # Example
/// ```
/// use dosrec_signatures::parse_hex;
/// assert_eq!(parse_hex("55 8b ec").unwrap(), vec![0x55, 0x8B, 0xEC]);
/// assert_eq!(parse_hex("558BEC").unwrap(), vec![0x55, 0x8B, 0xEC]);
/// ```
pub fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let digits: Vec<u8> = s.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(LibraryError::InvalidHex(format!(
            "odd number of digits ({})",
            digits.len()
        )));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair)
                .map_err(|_| LibraryError::InvalidHex("non-ASCII input".to_string()))?;
            u8::from_str_radix(text, 16)
                .map_err(|_| LibraryError::InvalidHex(format!("invalid byte {:?}", text)))
        })
        .collect()
}

/// Formats bytes as space-separated upper-case hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `#[serde(with = "...")]` adapter storing `Vec<u8>` as a hex string.
pub(crate) mod serde_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_hex(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_hex(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_hex() {
        assert!(parse_hex("5").is_err());
        assert!(parse_hex("zz").is_err());
        assert!(parse_hex("").unwrap().is_empty());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x9A, 0x00, 0x0e]), "9A 00 0E");
    }
}
