//! # dosrec-signatures
//!
//! Library-routine recognition for statically linked real-mode programs.
//!
//! An [`ObjectLibrary`] holds the code of every object module of a runtime
//! library together with its fixups and public names. The
//! [`LibraryMatcher`] slides each module over the program's code and accepts
//! windows where the bytes agree everywhere except at link-time patched
//! positions, producing [`ModuleMatch`]es that bind program address ranges
//! to library symbols.
//!
//! # Example
//!
//! ```ignore
//! use dosrec_signatures::{LibraryMatcher, ObjectLibrary};
//!
//! let library = ObjectLibrary::load_json("clib.json")?;
//! let matcher = LibraryMatcher::new(&library);
//! for m in matcher.scan(&segment) {
//!     println!("{} at {:04X}", m.module, m.start);
//! }
//! ```

mod hex;
mod library;
mod matcher;

pub use hex::{parse_hex, to_hex};
pub use library::{Fixup, FixupKind, ModuleSegment, ObjectLibrary, ObjectModule, PublicName};
pub use matcher::{LibraryMatcher, MatchSet, ModuleMatch};

/// Error type for library operations.
#[derive(Debug, thiserror::Error)]
pub enum LibraryError {
    #[error("invalid hex data: {0}")]
    InvalidHex(String),

    #[error("invalid module {module}: {reason}")]
    InvalidModule { module: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LibraryError>;
