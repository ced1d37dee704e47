//! Disassembly error types.

use dosrec_core::SegOff;
use thiserror::Error;

/// Error type for instruction decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Unknown opcode encountered.
    #[error("unknown opcode at {address}: {bytes:02x?}")]
    UnknownOpcode { address: SegOff, bytes: Vec<u8> },

    /// Instruction was truncated (not enough bytes).
    #[error("truncated instruction at {address}: need {needed} bytes, have {available}")]
    Truncated {
        address: SegOff,
        needed: usize,
        available: usize,
    },

    /// Invalid instruction encoding.
    #[error("invalid encoding at {address}: {reason}")]
    InvalidEncoding { address: SegOff, reason: String },

    /// Unsupported instruction or feature.
    #[error("unsupported instruction at {address}: {reason}")]
    Unsupported { address: SegOff, reason: String },
}

impl DecodeError {
    /// Creates a new UnknownOpcode error.
    pub fn unknown_opcode(address: SegOff, bytes: &[u8]) -> Self {
        Self::UnknownOpcode {
            address,
            bytes: bytes.to_vec(),
        }
    }

    /// Creates a new Truncated error.
    pub fn truncated(address: SegOff, needed: usize, available: usize) -> Self {
        Self::Truncated {
            address,
            needed,
            available,
        }
    }

    /// Creates a new InvalidEncoding error.
    pub fn invalid_encoding(address: SegOff, reason: impl Into<String>) -> Self {
        Self::InvalidEncoding {
            address,
            reason: reason.into(),
        }
    }

    /// Creates a new Unsupported error.
    pub fn unsupported(address: SegOff, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            address,
            reason: reason.into(),
        }
    }

    /// Returns true if the byte stream ran out mid-instruction.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }

    /// Address of the failing instruction.
    pub fn address(&self) -> SegOff {
        match self {
            Self::UnknownOpcode { address, .. }
            | Self::Truncated { address, .. }
            | Self::InvalidEncoding { address, .. }
            | Self::Unsupported { address, .. } => *address,
        }
    }
}
