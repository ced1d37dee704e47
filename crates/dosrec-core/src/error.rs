//! Error types for dosrec-core.

use crate::SegmentId;
use thiserror::Error;

/// Core error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A textual address could not be parsed.
    #[error("invalid address `{0}` (expected SEG:OFF in hex)")]
    InvalidAddress(String),

    /// An offset lies past the end of a segment.
    #[error("offset {offset:#x} is outside segment {segment}")]
    OffsetOutOfBounds { segment: SegmentId, offset: u32 },
}
