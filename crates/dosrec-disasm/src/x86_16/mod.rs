//! 16-bit real-mode x86 instruction decoder.
//!
//! It handles:
//! - Legacy prefixes (REP, LOCK, segment overrides, operand/address size)
//! - The 24 ModR/M memory addressing shapes of 16-bit mode
//! - One-byte opcodes and the opcode groups 80-83, C0-D3, F6/F7, FE/FF
//! - The real-mode subset of the `0F` map (near Jcc, MOVZX/MOVSX, FS/GS)
//! - x87 escapes D8-DF
//! - The overlay-manager interrupt

mod decoder;
mod modrm;
mod opcodes;
mod prefix;
mod x87;

pub use decoder::{Decoder16, DecoderOptions};
