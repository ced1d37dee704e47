//! Disassembler traits.

use crate::DecodeError;
use dosrec_core::{Instruction, SegOff};

/// Result of decoding an instruction.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
    /// The decoded instruction.
    pub instruction: Instruction,
    /// Number of bytes consumed.
    pub size: usize,
}

/// Trait for instruction decoders.
pub trait Disassembler {
    /// Decode a single instruction starting at the given address.
    ///
    /// # Arguments
    /// * `bytes` - The raw bytes to decode
    /// * `address` - The `segment:offset` of the first byte
    ///
    /// # Returns
    /// The decoded instruction and the number of bytes consumed.
    fn decode_instruction(&self, bytes: &[u8], address: SegOff)
        -> Result<DecodedInstruction, DecodeError>;

    /// Returns the maximum instruction size.
    fn max_instruction_size(&self) -> usize;

    /// Disassemble a block of code linearly.
    fn disassemble_block(
        &self,
        bytes: &[u8],
        start: SegOff,
    ) -> Vec<Result<Instruction, DecodeError>> {
        let mut instructions = Vec::new();
        let mut offset = 0;

        while offset < bytes.len() {
            let address = start.wrapping_add(offset as u16);

            match self.decode_instruction(&bytes[offset..], address) {
                Ok(decoded) => {
                    offset += decoded.size;
                    instructions.push(Ok(decoded.instruction));
                }
                Err(e) => {
                    // On error, skip one byte and continue
                    offset += 1;
                    instructions.push(Err(e));
                }
            }
        }

        instructions
    }
}
