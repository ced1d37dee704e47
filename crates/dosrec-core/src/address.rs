//! Real-mode addresses.

use crate::Error;
use std::fmt;
use std::str::FromStr;

/// A real-mode `segment:offset` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegOff {
    /// Segment paragraph.
    pub segment: u16,
    /// Offset within the segment.
    pub offset: u16,
}

impl SegOff {
    /// Creates a new address.
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Returns the 20-bit linear address (`segment * 16 + offset`).
    pub fn linear(&self) -> u32 {
        ((self.segment as u32) << 4) + self.offset as u32
    }

    /// Returns the same segment with a different offset.
    pub fn with_offset(self, offset: u16) -> Self {
        Self { offset, ..self }
    }

    /// Adds `delta` to the offset, wrapping inside the segment.
    pub fn wrapping_add(self, delta: u16) -> Self {
        self.with_offset(self.offset.wrapping_add(delta))
    }
}

impl fmt::Display for SegOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.segment, self.offset)
    }
}

impl FromStr for SegOff {
    type Err = Error;

    /// Parses `SEG:OFF` with both halves in hex, e.g. `1A2B:0010`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let (seg, off) = s.split_once(':').ok_or_else(invalid)?;
        let parse = |part: &str| {
            let part = part.trim();
            let part = part.strip_prefix("0x").unwrap_or(part);
            u16::from_str_radix(part, 16).map_err(|_| invalid())
        };
        Ok(Self::new(parse(seg)?, parse(off)?))
    }
}

/// Identity of an address-space partition: an overlay and a segment within it.
///
/// Overlay 0 is the resident program; every other overlay is its own address
/// space loaded on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SegmentId {
    /// Overlay number (0 for the resident program).
    pub overlay: u16,
    /// Segment paragraph.
    pub segment: u16,
}

impl SegmentId {
    /// Creates a segment identity.
    pub const fn new(overlay: u16, segment: u16) -> Self {
        Self { overlay, segment }
    }

    /// Creates the identity of a resident (non-overlay) segment.
    pub const fn resident(segment: u16) -> Self {
        Self::new(0, segment)
    }

    /// Returns true if this segment belongs to an overlay.
    pub fn is_overlay(&self) -> bool {
        self.overlay != 0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_overlay() {
            write!(f, "ovl{}:{:04X}", self.overlay, self.segment)
        } else {
            write!(f, "{:04X}", self.segment)
        }
    }
}

/// A fully qualified code address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CodeAddress {
    pub segment: SegmentId,
    pub offset: u16,
}

impl CodeAddress {
    pub const fn new(segment: SegmentId, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// Returns the `segment:offset` pair, dropping the overlay.
    pub fn seg_off(&self) -> SegOff {
        SegOff::new(self.segment.segment, self.offset)
    }

    /// Linear address within the owning overlay.
    pub fn linear(&self) -> u32 {
        self.seg_off().linear()
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:04X}", self.segment, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear() {
        assert_eq!(SegOff::new(0x1234, 0x0010).linear(), 0x12350);
        assert_eq!(SegOff::new(0xFFFF, 0xFFFF).linear(), 0x10FFEF);
    }

    #[test]
    fn test_parse() {
        assert_eq!("1a2b:0010".parse::<SegOff>().unwrap(), SegOff::new(0x1A2B, 0x10));
        assert_eq!("0x0000:0x0100".parse::<SegOff>().unwrap(), SegOff::new(0, 0x100));
        assert!("12345".parse::<SegOff>().is_err());
        assert!("zz:10".parse::<SegOff>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(SegOff::new(0x1A, 0x2).to_string(), "001A:0002");
        assert_eq!(SegmentId::new(3, 0).to_string(), "ovl3:0000");
        assert_eq!(SegmentId::resident(0x10).to_string(), "0010");
    }
}
