//! # dosrec-disasm
//!
//! Instruction decoder for 16-bit real-mode x86 code.
//!
//! Covers the 8086/80186/80286 instruction set, the 80386 operand-size
//! prefix with the common `0F` extensions used by real-mode compilers, the
//! x87 escape opcodes, and the overlay-manager interrupt used by overlaid
//! programs.

pub mod error;
pub mod traits;
pub mod x86_16;

pub use error::DecodeError;
pub use traits::{DecodedInstruction, Disassembler};
pub use x86_16::{Decoder16, DecoderOptions};
