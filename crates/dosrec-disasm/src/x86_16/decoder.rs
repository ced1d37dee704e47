//! 16-bit real-mode instruction decoder.

use super::modrm::{decode_modrm_reg, decode_modrm_rm, decode_sreg, ModRM};
use super::opcodes::{
    OperandEncoding, GROUP1_OPS, GROUP2_OPS, GROUP3_OPS, GROUP5_OPS, OPCODE_TABLE, OPCODE_TABLE_0F,
};
use super::prefix::{self, word_size};
use super::x87::decode_x87;
use crate::error::DecodeError;
use crate::traits::{DecodedInstruction, Disassembler};
use dosrec_core::{
    Instruction, MemoryRef, Mnemonic, Operand, Prefixes, Register, SegOff,
};

/// Longest encoding accepted, prefixes included.
const MAX_INSTRUCTION_SIZE: usize = 15;

/// Decoder options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Interrupt vector of the overlay manager. `INT n` with this vector is
    /// followed by an overlay-number byte and an offset word.
    pub overlay_interrupt: Option<u8>,
    /// Accept the operand-size prefix and the `0F` opcode map.
    pub allow_386: bool,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            overlay_interrupt: Some(0x3F),
            allow_386: true,
        }
    }
}

/// Real-mode x86 instruction decoder.
#[derive(Debug, Clone, Default)]
pub struct Decoder16 {
    pub options: DecoderOptions,
}

/// Byte reader over one instruction's encoding.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    address: SegOff,
}

impl<'a> Reader<'a> {
    fn truncated(&self, needed: usize) -> DecodeError {
        DecodeError::truncated(self.address, self.pos + needed, self.bytes.len())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self.bytes.get(self.pos).ok_or_else(|| self.truncated(1))?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        match self.bytes.get(self.pos..self.pos + 2) {
            Some(b) => {
                self.pos += 2;
                Ok(u16::from_le_bytes([b[0], b[1]]))
            }
            None => Err(self.truncated(2)),
        }
    }

    /// Reads an immediate of `bits` width, zero-extended (32-bit sign-preserving).
    fn imm(&mut self, bits: u16) -> Result<Operand, DecodeError> {
        let value = match bits {
            8 => self.u8()? as i32,
            16 => self.u16()? as i32,
            _ => {
                let lo = self.u16()? as u32;
                let hi = self.u16()? as u32;
                (hi << 16 | lo) as i32
            }
        };
        Ok(Operand::imm(value, bits as u8))
    }

    /// Reads a sign-extended 8-bit immediate.
    fn imm8s(&mut self) -> Result<Operand, DecodeError> {
        Ok(Operand::imm(self.u8()? as i8 as i32, 8))
    }

    fn modrm(&mut self) -> Result<ModRM, DecodeError> {
        Ok(ModRM::parse(self.u8()?))
    }

    fn rm(&mut self, modrm: ModRM, prefixes: &Prefixes, size: u16) -> Result<Operand, DecodeError> {
        let (operand, consumed) = decode_modrm_rm(&self.bytes[self.pos..], modrm, prefixes, size)
            .ok_or_else(|| self.truncated(2))?;
        self.pos += consumed;
        Ok(operand)
    }

    /// Reads a relative displacement and resolves it against the end of the
    /// instruction, which is the end of the displacement.
    fn relative(&mut self, wide: bool) -> Result<Operand, DecodeError> {
        let displacement = if wide {
            self.u16()? as i16
        } else {
            self.u8()? as i8 as i16
        };
        let target = self
            .address
            .offset
            .wrapping_add(self.pos as u16)
            .wrapping_add(displacement as u16);
        Ok(Operand::relative(displacement, target))
    }

    fn unknown(&self) -> DecodeError {
        DecodeError::unknown_opcode(self.address, &self.bytes[..self.pos.min(self.bytes.len())])
    }
}

impl Decoder16 {
    /// Creates a decoder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder with the given options.
    pub fn with_options(options: DecoderOptions) -> Self {
        Self { options }
    }

    fn finish(
        reader: &Reader<'_>,
        mnemonic: Mnemonic,
        operands: Vec<Operand>,
        prefixes: Prefixes,
    ) -> Result<DecodedInstruction, DecodeError> {
        if reader.pos > MAX_INSTRUCTION_SIZE {
            return Err(DecodeError::invalid_encoding(
                reader.address,
                format!("instruction longer than {} bytes", MAX_INSTRUCTION_SIZE),
            ));
        }
        let instruction = Instruction::new(reader.address, reader.pos as u8, mnemonic)
            .with_operands(operands)
            .with_prefixes(prefixes);
        Ok(DecodedInstruction {
            instruction,
            size: reader.pos,
        })
    }

    /// Decode group 1 instructions (0x80-0x83).
    fn decode_group1(
        reader: &mut Reader<'_>,
        prefixes: Prefixes,
        opcode: u8,
    ) -> Result<DecodedInstruction, DecodeError> {
        let modrm = reader.modrm()?;
        let mnemonic = GROUP1_OPS[modrm.reg as usize];

        let size = if opcode == 0x80 || opcode == 0x82 {
            8
        } else {
            word_size(&prefixes)
        };
        let rm = reader.rm(modrm, &prefixes, size)?;

        let imm = match opcode {
            // 0x82 is an alias of 0x80 in real mode
            0x80 | 0x82 => reader.imm(8)?,
            0x81 => reader.imm(size)?,
            _ => reader.imm8s()?,
        };

        Self::finish(reader, mnemonic, vec![rm, imm], prefixes)
    }

    /// Decode group 2 instructions (shift/rotate: 0xC0-0xC1, 0xD0-0xD3).
    fn decode_group2(
        reader: &mut Reader<'_>,
        prefixes: Prefixes,
        opcode: u8,
    ) -> Result<DecodedInstruction, DecodeError> {
        let modrm = reader.modrm()?;
        let mnemonic = GROUP2_OPS[modrm.reg as usize];

        let size = if opcode == 0xC0 || opcode == 0xD0 || opcode == 0xD2 {
            8
        } else {
            word_size(&prefixes)
        };
        let rm = reader.rm(modrm, &prefixes, size)?;

        let count = match opcode {
            0xD0 | 0xD1 => Operand::imm(1, 8),
            0xD2 | 0xD3 => Operand::reg(Register::CL),
            _ => reader.imm(8)?,
        };

        Self::finish(reader, mnemonic, vec![rm, count], prefixes)
    }

    /// Decode group 3 instructions (0xF6-0xF7).
    fn decode_group3(
        reader: &mut Reader<'_>,
        prefixes: Prefixes,
        opcode: u8,
    ) -> Result<DecodedInstruction, DecodeError> {
        let modrm = reader.modrm()?;
        let mnemonic = GROUP3_OPS[modrm.reg as usize];
        let size = if opcode == 0xF6 { 8 } else { word_size(&prefixes) };
        let rm = reader.rm(modrm, &prefixes, size)?;

        let mut operands = vec![rm];
        if modrm.reg < 2 {
            operands.push(reader.imm(size)?);
        }
        Self::finish(reader, mnemonic, operands, prefixes)
    }

    /// Decode group 4 (0xFE) and group 5 (0xFF) instructions.
    fn decode_group45(
        reader: &mut Reader<'_>,
        prefixes: Prefixes,
        opcode: u8,
    ) -> Result<DecodedInstruction, DecodeError> {
        let modrm = reader.modrm()?;
        let mnemonic = if opcode == 0xFE {
            match modrm.reg {
                0 => Mnemonic::Inc,
                1 => Mnemonic::Dec,
                _ => return Err(reader.unknown()),
            }
        } else {
            GROUP5_OPS[modrm.reg as usize].ok_or_else(|| reader.unknown())?
        };

        let size = match mnemonic {
            _ if opcode == 0xFE => 8,
            Mnemonic::CallFar | Mnemonic::JmpFar => {
                if modrm.is_register() {
                    return Err(DecodeError::invalid_encoding(
                        reader.address,
                        "far transfer through a register",
                    ));
                }
                32
            }
            Mnemonic::Call | Mnemonic::Jmp => 16,
            _ => word_size(&prefixes),
        };
        let rm = reader.rm(modrm, &prefixes, size)?;
        Self::finish(reader, mnemonic, vec![rm], prefixes)
    }

    fn decode_entry(
        &self,
        reader: &mut Reader<'_>,
        prefixes: Prefixes,
        opcode: u8,
        mnemonic: Mnemonic,
        encoding: OperandEncoding,
        entry_size: u16,
    ) -> Result<DecodedInstruction, DecodeError> {
        let size = if entry_size == 8 { 8 } else { word_size(&prefixes) };
        let accumulator = Operand::reg(Register::from_encoding(0, size));
        let mut mnemonic = mnemonic;
        let mut operands = Vec::new();

        match encoding {
            OperandEncoding::None => {}

            OperandEncoding::OpReg => {
                operands.push(Operand::reg(Register::from_encoding(opcode & 0x07, size)));
            }

            OperandEncoding::OpReg_Imm => {
                operands.push(Operand::reg(Register::from_encoding(opcode & 0x07, size)));
                operands.push(reader.imm(size)?);
            }

            OperandEncoding::Acc_OpReg => {
                operands.push(accumulator);
                operands.push(Operand::reg(Register::from_encoding(opcode & 0x07, size)));
            }

            OperandEncoding::ModRmRm_Reg | OperandEncoding::ModRmReg_Rm | OperandEncoding::ModRmRmOnly => {
                let modrm = reader.modrm()?;
                let (reg_size, rm_size) = match mnemonic {
                    // the 0F B6/BE forms read a byte, B7/BF a word
                    Mnemonic::Movzx | Mnemonic::Movsx => (word_size(&prefixes), entry_size),
                    Mnemonic::Les | Mnemonic::Lds | Mnemonic::Bound => (16, 32),
                    _ => (size, size),
                };
                if matches!(mnemonic, Mnemonic::Lea | Mnemonic::Les | Mnemonic::Lds | Mnemonic::Bound)
                    && modrm.is_register()
                {
                    return Err(DecodeError::invalid_encoding(
                        reader.address,
                        "memory operand required",
                    ));
                }
                if encoding == OperandEncoding::ModRmRmOnly && modrm.reg != 0 {
                    return Err(reader.unknown());
                }

                let mut rm = reader.rm(modrm, &prefixes, rm_size)?;
                if mnemonic == Mnemonic::Lea {
                    if let Operand::Memory(mem) = &mut rm {
                        mem.size = 0;
                    }
                }

                match encoding {
                    OperandEncoding::ModRmRm_Reg => {
                        operands.push(rm);
                        operands.push(decode_modrm_reg(modrm, reg_size));
                    }
                    OperandEncoding::ModRmReg_Rm => {
                        operands.push(decode_modrm_reg(modrm, reg_size));
                        operands.push(rm);
                    }
                    _ => operands.push(rm),
                }
            }

            OperandEncoding::ModRmRm_Sreg | OperandEncoding::ModRmSreg_Rm => {
                let modrm = reader.modrm()?;
                let sreg = decode_sreg(modrm).ok_or_else(|| {
                    DecodeError::invalid_encoding(reader.address, "invalid segment register")
                })?;
                let rm = reader.rm(modrm, &prefixes, 16)?;
                if encoding == OperandEncoding::ModRmRm_Sreg {
                    operands.extend([rm, sreg]);
                } else {
                    operands.extend([sreg, rm]);
                }
            }

            OperandEncoding::ModRmReg_Rm_Imm | OperandEncoding::ModRmReg_Rm_Imm8 => {
                let modrm = reader.modrm()?;
                let rm = reader.rm(modrm, &prefixes, size)?;
                let imm = if encoding == OperandEncoding::ModRmReg_Rm_Imm8 {
                    reader.imm8s()?
                } else {
                    reader.imm(size)?
                };
                operands.extend([decode_modrm_reg(modrm, size), rm, imm]);
            }

            OperandEncoding::Acc_Imm => {
                operands.push(accumulator);
                operands.push(reader.imm(size)?);
            }

            OperandEncoding::Rm_Imm => {
                let modrm = reader.modrm()?;
                if modrm.reg != 0 {
                    return Err(reader.unknown());
                }
                let rm = reader.rm(modrm, &prefixes, size)?;
                operands.push(rm);
                operands.push(reader.imm(size)?);
            }

            OperandEncoding::Acc_Moffs | OperandEncoding::Moffs_Acc => {
                let offset = reader.u16()?;
                let mut mem = MemoryRef::direct(offset, (size / 8) as u8);
                if let Some(segment) = prefixes.segment {
                    mem = mem.with_segment(segment);
                }
                if encoding == OperandEncoding::Acc_Moffs {
                    operands.extend([accumulator, Operand::Memory(mem)]);
                } else {
                    operands.extend([Operand::Memory(mem), accumulator]);
                }
            }

            OperandEncoding::Acc_Port => {
                operands.push(accumulator);
                operands.push(reader.imm(8)?);
            }
            OperandEncoding::Port_Acc => {
                operands.push(reader.imm(8)?);
                operands.push(accumulator);
            }
            OperandEncoding::Acc_Dx => {
                operands.extend([accumulator, Operand::reg(Register::DX)]);
            }
            OperandEncoding::Dx_Acc => {
                operands.extend([Operand::reg(Register::DX), accumulator]);
            }

            OperandEncoding::Sreg(id) => operands.push(Operand::reg(Register::segment(id))),

            OperandEncoding::Rel8 => operands.push(reader.relative(false)?),
            OperandEncoding::Rel16 => {
                if prefixes.operand_size {
                    return Err(DecodeError::unsupported(
                        reader.address,
                        "32-bit relative displacement",
                    ));
                }
                operands.push(reader.relative(true)?);
            }

            OperandEncoding::Imm8 => {
                let value = reader.u8()?;
                if mnemonic == Mnemonic::Int && self.options.overlay_interrupt == Some(value) {
                    let overlay = reader.u8()? as u16;
                    let offset = reader.u16()?;
                    mnemonic = Mnemonic::CallOverlay;
                    operands.push(Operand::OverlayTarget { overlay, offset });
                } else {
                    operands.push(Operand::imm(value as i32, 8));
                }
            }
            OperandEncoding::Imm8S => operands.push(reader.imm8s()?),
            OperandEncoding::Imm16 => operands.push(reader.imm(16)?),
            OperandEncoding::Imm16_Imm8 => {
                operands.push(reader.imm(16)?);
                operands.push(reader.imm(8)?);
            }
            OperandEncoding::Const8(value) => operands.push(Operand::imm(value as i32, 8)),

            OperandEncoding::FarPtr => {
                let offset = reader.u16()?;
                let segment = reader.u16()?;
                operands.push(Operand::far(SegOff::new(segment, offset)));
            }
        }

        Self::finish(reader, mnemonic, operands, prefixes)
    }
}

impl Disassembler for Decoder16 {
    fn decode_instruction(
        &self,
        bytes: &[u8],
        address: SegOff,
    ) -> Result<DecodedInstruction, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::truncated(address, 1, 0));
        }

        // Parse prefixes
        let (prefixes, prefix_len) = prefix::parse(bytes);
        let mut reader = Reader {
            bytes,
            pos: prefix_len,
            address,
        };
        if prefix_len >= MAX_INSTRUCTION_SIZE {
            return Err(DecodeError::invalid_encoding(address, "too many prefixes"));
        }

        let opcode = reader.u8()?;

        if !self.options.allow_386 && (prefixes.operand_size || opcode == 0x0F) {
            return Err(reader.unknown());
        }
        if prefixes.address_size {
            return Err(DecodeError::unsupported(address, "32-bit addressing"));
        }

        if opcode == 0x0F {
            let opcode2 = reader.u8()?;
            let entry = OPCODE_TABLE_0F[opcode2 as usize].ok_or_else(|| reader.unknown())?;
            return self.decode_entry(
                &mut reader,
                prefixes,
                opcode2,
                entry.mnemonic,
                entry.encoding,
                entry.size,
            );
        }

        match opcode {
            0x80..=0x83 => return Self::decode_group1(&mut reader, prefixes, opcode),
            0xC0 | 0xC1 | 0xD0..=0xD3 => return Self::decode_group2(&mut reader, prefixes, opcode),
            0xF6 | 0xF7 => return Self::decode_group3(&mut reader, prefixes, opcode),
            0xFE | 0xFF => return Self::decode_group45(&mut reader, prefixes, opcode),
            0xD8..=0xDF => {
                let (mnemonic, operands, consumed) =
                    decode_x87(opcode, &bytes[reader.pos..], &prefixes)
                        .ok_or_else(|| reader.truncated(2))?;
                reader.pos += consumed;
                return Self::finish(&reader, mnemonic, operands, prefixes);
            }
            _ => {}
        }

        let entry = OPCODE_TABLE[opcode as usize].ok_or_else(|| reader.unknown())?;
        self.decode_entry(
            &mut reader,
            prefixes,
            opcode,
            entry.mnemonic,
            entry.encoding,
            entry.size,
        )
    }

    fn max_instruction_size(&self) -> usize {
        MAX_INSTRUCTION_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{CallTarget, Condition, ControlFlow, RepeatPrefix, SegmentBase};

    fn decode(bytes: &[u8]) -> DecodedInstruction {
        Decoder16::new()
            .decode_instruction(bytes, SegOff::new(0x1000, 0x100))
            .unwrap()
    }

    #[test]
    fn test_nop() {
        let result = decode(&[0x90]);
        assert_eq!(result.instruction.mnemonic, Mnemonic::Nop);
        assert_eq!(result.size, 1);
    }

    #[test]
    fn test_prologue() {
        let push = decode(&[0x55]);
        assert_eq!(push.instruction.to_string(), "push bp");
        let mov = decode(&[0x8B, 0xEC]);
        assert_eq!(mov.instruction.to_string(), "mov bp, sp");
        let sub = decode(&[0x83, 0xEC, 0x06]);
        assert_eq!(sub.instruction.to_string(), "sub sp, 0x6");
        assert_eq!(sub.size, 3);
    }

    #[test]
    fn test_frame_access() {
        // mov ax, [bp+6]
        let result = decode(&[0x8B, 0x46, 0x06]);
        assert_eq!(result.instruction.to_string(), "mov ax, word ptr [bp + 0x6]");
        assert!(result.instruction.operands[1].as_memory().unwrap().is_frame_access());
    }

    #[test]
    fn test_call_rel16_wraps() {
        // call -0x103 from 0x100 (3 bytes): target 0x0000
        let result = decode(&[0xE8, 0xFD, 0xFE]);
        assert_eq!(
            result.instruction.control_flow(),
            ControlFlow::Call {
                target: CallTarget::Near(0x0000),
                return_addr: 0x103
            }
        );
    }

    #[test]
    fn test_jcc_rel8() {
        let result = decode(&[0x75, 0x10]);
        assert_eq!(result.instruction.mnemonic, Mnemonic::Jcc(Condition::NotEqual));
        assert!(matches!(
            result.instruction.control_flow(),
            ControlFlow::ConditionalBranch { target: 0x112, fallthrough: 0x102 }
        ));
    }

    #[test]
    fn test_near_jcc_0f() {
        let result = decode(&[0x0F, 0x84, 0x00, 0x01]);
        assert_eq!(result.size, 4);
        assert_eq!(result.instruction.branch_targets(), vec![0x204]);
    }

    #[test]
    fn test_far_call() {
        let result = decode(&[0x9A, 0x34, 0x12, 0x00, 0x20]);
        assert_eq!(
            result.instruction.control_flow(),
            ControlFlow::Call {
                target: CallTarget::Far(SegOff::new(0x2000, 0x1234)),
                return_addr: 0x105
            }
        );
    }

    #[test]
    fn test_overlay_interrupt() {
        let result = decode(&[0xCD, 0x3F, 0x02, 0x10, 0x00]);
        assert_eq!(result.size, 5);
        assert_eq!(result.instruction.mnemonic, Mnemonic::CallOverlay);
        assert_eq!(
            result.instruction.operands,
            vec![Operand::OverlayTarget { overlay: 2, offset: 0x10 }]
        );

        let plain = Decoder16::with_options(DecoderOptions {
            overlay_interrupt: None,
            allow_386: true,
        });
        let result = plain
            .decode_instruction(&[0xCD, 0x3F, 0x02], SegOff::new(0, 0))
            .unwrap();
        assert_eq!(result.size, 2);
        assert_eq!(result.instruction.mnemonic, Mnemonic::Int);
    }

    #[test]
    fn test_segment_override() {
        // mov ax, es:[bx]
        let result = decode(&[0x26, 0x8B, 0x07]);
        assert_eq!(result.size, 3);
        let mem = result.instruction.operands[1].as_memory().unwrap();
        assert_eq!(mem.segment, SegmentBase::Register(Register::ES));
        assert!(mem.segment_override);
    }

    #[test]
    fn test_rep_movsw() {
        let result = decode(&[0xF3, 0xA5]);
        assert_eq!(result.instruction.prefixes.repeat, Some(RepeatPrefix::Rep));
        assert_eq!(result.instruction.to_string(), "rep movsw");
    }

    #[test]
    fn test_mov_sreg() {
        let result = decode(&[0x8E, 0xC0]);
        assert_eq!(result.instruction.to_string(), "mov es, ax");
        let err = Decoder16::new()
            .decode_instruction(&[0x8E, 0xF8], SegOff::new(0, 0))
            .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEncoding { .. }));
    }

    #[test]
    fn test_operand_size_prefix() {
        // mov eax, 0x12345678
        let result = decode(&[0x66, 0xB8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(result.size, 6);
        assert_eq!(result.instruction.to_string(), "mov eax, 0x12345678");
    }

    #[test]
    fn test_truncated() {
        let err = Decoder16::new()
            .decode_instruction(&[0xB8, 0x01], SegOff::new(0, 0))
            .unwrap_err();
        assert!(err.is_truncated());
        let err = Decoder16::new()
            .decode_instruction(&[0x26], SegOff::new(0, 0))
            .unwrap_err();
        assert!(err.is_truncated());
    }

    #[test]
    fn test_unknown_opcode() {
        let err = Decoder16::new()
            .decode_instruction(&[0xFF, 0xF8], SegOff::new(0, 0))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOpcode { .. }));
        let err = Decoder16::new()
            .decode_instruction(&[0xD6], SegOff::new(0, 0))
            .unwrap_err();
        assert!(matches!(err, DecodeError::UnknownOpcode { .. }));
    }

    #[test]
    fn test_address_size_unsupported() {
        let err = Decoder16::new()
            .decode_instruction(&[0x67, 0x8B, 0x00], SegOff::new(0, 0))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { .. }));
    }

    #[test]
    fn test_indirect_jump_through_table() {
        // jmp cs:[bx+0x200]
        let result = decode(&[0x2E, 0xFF, 0xA7, 0x00, 0x02]);
        assert_eq!(result.instruction.control_flow(), ControlFlow::IndirectJump);
        let mem = result.instruction.operands[0].as_memory().unwrap();
        assert_eq!(mem.segment_register(), Some(Register::CS));
        assert_eq!(mem.displacement, 0x200);
    }
}
