//! Fatal analysis errors.

use dosrec_core::{CallingConvention, CodeAddress, SegmentId};
use dosrec_disasm::DecodeError;
use thiserror::Error;

/// Conditions that abort a run.
///
/// Recoverable anomalies (unresolved switch shapes, unmatched library
/// windows, unknown opcodes) are logged and counted instead.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("bad frame shape in function at {function}: {reason}")]
    FrameShape { function: CodeAddress, reason: String },

    #[error(
        "function at {function} returns as {first} and as {second} (second return at {at:04X})"
    )]
    InconsistentConvention {
        function: CodeAddress,
        first: CallingConvention,
        second: CallingConvention,
        at: u16,
    },

    #[error("target {target} of instruction at {site} lies outside every known segment")]
    TargetOutOfBounds { site: CodeAddress, target: String },

    #[error("unknown segment {0}")]
    UnknownSegment(SegmentId),

    #[error(transparent)]
    Core(#[from] dosrec_core::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
