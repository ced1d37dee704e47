//! Real-mode opcode definitions and lookup.

#![allow(non_camel_case_types)]

use dosrec_core::{Condition, Mnemonic};

/// Operand encoding type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandEncoding {
    /// No operands
    None,
    /// Register in opcode (low 3 bits)
    OpReg,
    /// Register in opcode, immediate of the register's size
    OpReg_Imm,
    /// Accumulator, register in opcode (XCHG AX, r16)
    Acc_OpReg,
    /// ModR/M: r/m, reg
    ModRmRm_Reg,
    /// ModR/M: reg, r/m
    ModRmReg_Rm,
    /// ModR/M: r/m only (reg field is opcode extension)
    ModRmRmOnly,
    /// ModR/M: r/m16, segment register
    ModRmRm_Sreg,
    /// ModR/M: segment register, r/m16
    ModRmSreg_Rm,
    /// ModR/M: reg, r/m, immediate of operand size
    ModRmReg_Rm_Imm,
    /// ModR/M: reg, r/m, sign-extended 8-bit immediate
    ModRmReg_Rm_Imm8,
    /// AL/AX, immediate
    Acc_Imm,
    /// r/m, immediate
    Rm_Imm,
    /// AL/AX, direct memory offset
    Acc_Moffs,
    /// Direct memory offset, AL/AX
    Moffs_Acc,
    /// AL/AX, 8-bit port
    Acc_Port,
    /// 8-bit port, AL/AX
    Port_Acc,
    /// AL/AX, DX
    Acc_Dx,
    /// DX, AL/AX
    Dx_Acc,
    /// Fixed segment register
    Sreg(u16),
    /// Relative offset (jumps, calls)
    Rel8,
    Rel16,
    /// Immediate only
    Imm8,
    /// Sign-extended 8-bit immediate
    Imm8S,
    Imm16,
    /// ENTER: frame size, nesting level
    Imm16_Imm8,
    /// Implied 8-bit constant (INT 3)
    Const8(u8),
    /// Absolute `offset:segment` pointer
    FarPtr,
}

/// Opcode table entry.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeEntry {
    /// Mnemonic
    pub mnemonic: Mnemonic,
    /// Operand encoding
    pub encoding: OperandEncoding,
    /// Operand size in bits: 8 for byte forms, 16 for word forms that the
    /// operand-size prefix widens to 32
    pub size: u16,
}

impl OpcodeEntry {
    pub const fn new(mnemonic: Mnemonic, encoding: OperandEncoding) -> Self {
        Self {
            mnemonic,
            encoding,
            size: 16,
        }
    }

    pub const fn byte(mut self) -> Self {
        self.size = 8;
        self
    }
}

/// Const None for array initialization (stable Rust compatibility)
const NONE_ENTRY: Option<OpcodeEntry> = None;

const fn op(mnemonic: Mnemonic, encoding: OperandEncoding) -> Option<OpcodeEntry> {
    Some(OpcodeEntry::new(mnemonic, encoding))
}

const fn op8(mnemonic: Mnemonic, encoding: OperandEncoding) -> Option<OpcodeEntry> {
    Some(OpcodeEntry::new(mnemonic, encoding).byte())
}

/// The classic ALU rows (00-05, 08-0D, ...), in opcode order.
const ALU_ROWS: [Mnemonic; 8] = [
    Mnemonic::Add,
    Mnemonic::Or,
    Mnemonic::Adc,
    Mnemonic::Sbb,
    Mnemonic::And,
    Mnemonic::Sub,
    Mnemonic::Xor,
    Mnemonic::Cmp,
];

/// One-byte opcode table.
///
/// Prefixes, the `0F` escape, opcode groups and x87 escapes are handled by
/// the decoder before this table is consulted.
pub static OPCODE_TABLE: [Option<OpcodeEntry>; 256] = {
    use Mnemonic::*;
    use OperandEncoding as E;

    let mut table: [Option<OpcodeEntry>; 256] = [NONE_ENTRY; 256];

    let mut row = 0;
    while row < 8 {
        let base = row * 8;
        let mnemonic = ALU_ROWS[row];
        table[base] = op8(mnemonic, E::ModRmRm_Reg);
        table[base + 1] = op(mnemonic, E::ModRmRm_Reg);
        table[base + 2] = op8(mnemonic, E::ModRmReg_Rm);
        table[base + 3] = op(mnemonic, E::ModRmReg_Rm);
        table[base + 4] = op8(mnemonic, E::Acc_Imm);
        table[base + 5] = op(mnemonic, E::Acc_Imm);
        row += 1;
    }

    table[0x06] = op(Push, E::Sreg(0));
    table[0x07] = op(Pop, E::Sreg(0));
    table[0x0E] = op(Push, E::Sreg(1));
    table[0x16] = op(Push, E::Sreg(2));
    table[0x17] = op(Pop, E::Sreg(2));
    table[0x1E] = op(Push, E::Sreg(3));
    table[0x1F] = op(Pop, E::Sreg(3));

    table[0x27] = op(Daa, E::None);
    table[0x2F] = op(Das, E::None);
    table[0x37] = op(Aaa, E::None);
    table[0x3F] = op(Aas, E::None);

    let mut i = 0;
    while i < 8 {
        table[0x40 + i] = op(Inc, E::OpReg);
        table[0x48 + i] = op(Dec, E::OpReg);
        table[0x50 + i] = op(Push, E::OpReg);
        table[0x58 + i] = op(Pop, E::OpReg);
        table[0xB0 + i] = op8(Mov, E::OpReg_Imm);
        table[0xB8 + i] = op(Mov, E::OpReg_Imm);
        i += 1;
    }

    // 80186
    table[0x60] = op(Pusha, E::None);
    table[0x61] = op(Popa, E::None);
    table[0x62] = op(Bound, E::ModRmReg_Rm);
    table[0x68] = op(Push, E::Imm16);
    table[0x69] = op(Imul, E::ModRmReg_Rm_Imm);
    table[0x6A] = op(Push, E::Imm8S);
    table[0x6B] = op(Imul, E::ModRmReg_Rm_Imm8);
    table[0x6C] = op8(Insb, E::None);
    table[0x6D] = op(Insw, E::None);
    table[0x6E] = op8(Outsb, E::None);
    table[0x6F] = op(Outsw, E::None);

    let mut cc = 0;
    while cc < 16 {
        table[0x70 + cc] = op(Jcc(Condition::from_code(cc as u8)), E::Rel8);
        cc += 1;
    }

    table[0x84] = op8(Test, E::ModRmRm_Reg);
    table[0x85] = op(Test, E::ModRmRm_Reg);
    table[0x86] = op8(Xchg, E::ModRmRm_Reg);
    table[0x87] = op(Xchg, E::ModRmRm_Reg);
    table[0x88] = op8(Mov, E::ModRmRm_Reg);
    table[0x89] = op(Mov, E::ModRmRm_Reg);
    table[0x8A] = op8(Mov, E::ModRmReg_Rm);
    table[0x8B] = op(Mov, E::ModRmReg_Rm);
    table[0x8C] = op(Mov, E::ModRmRm_Sreg);
    table[0x8D] = op(Lea, E::ModRmReg_Rm);
    table[0x8E] = op(Mov, E::ModRmSreg_Rm);
    table[0x8F] = op(Pop, E::ModRmRmOnly);

    table[0x90] = op(Nop, E::None);
    let mut r = 1;
    while r < 8 {
        table[0x90 + r] = op(Xchg, E::Acc_OpReg);
        r += 1;
    }

    table[0x98] = op(Cbw, E::None);
    table[0x99] = op(Cwd, E::None);
    table[0x9A] = op(CallFar, E::FarPtr);
    table[0x9B] = op(Wait, E::None);
    table[0x9C] = op(Pushf, E::None);
    table[0x9D] = op(Popf, E::None);
    table[0x9E] = op(Sahf, E::None);
    table[0x9F] = op(Lahf, E::None);

    table[0xA0] = op8(Mov, E::Acc_Moffs);
    table[0xA1] = op(Mov, E::Acc_Moffs);
    table[0xA2] = op8(Mov, E::Moffs_Acc);
    table[0xA3] = op(Mov, E::Moffs_Acc);
    table[0xA4] = op8(Movsb, E::None);
    table[0xA5] = op(Movsw, E::None);
    table[0xA6] = op8(Cmpsb, E::None);
    table[0xA7] = op(Cmpsw, E::None);
    table[0xA8] = op8(Test, E::Acc_Imm);
    table[0xA9] = op(Test, E::Acc_Imm);
    table[0xAA] = op8(Stosb, E::None);
    table[0xAB] = op(Stosw, E::None);
    table[0xAC] = op8(Lodsb, E::None);
    table[0xAD] = op(Lodsw, E::None);
    table[0xAE] = op8(Scasb, E::None);
    table[0xAF] = op(Scasw, E::None);

    table[0xC2] = op(Ret, E::Imm16);
    table[0xC3] = op(Ret, E::None);
    table[0xC4] = op(Les, E::ModRmReg_Rm);
    table[0xC5] = op(Lds, E::ModRmReg_Rm);
    table[0xC6] = op8(Mov, E::Rm_Imm);
    table[0xC7] = op(Mov, E::Rm_Imm);
    table[0xC8] = op(Enter, E::Imm16_Imm8);
    table[0xC9] = op(Leave, E::None);
    table[0xCA] = op(Retf, E::Imm16);
    table[0xCB] = op(Retf, E::None);
    table[0xCC] = op(Int, E::Const8(3));
    table[0xCD] = op(Int, E::Imm8);
    table[0xCE] = op(Into, E::None);
    table[0xCF] = op(Iret, E::None);

    table[0xD4] = op(Aam, E::Imm8);
    table[0xD5] = op(Aad, E::Imm8);
    table[0xD7] = op8(Xlat, E::None);

    table[0xE0] = op(Loopne, E::Rel8);
    table[0xE1] = op(Loope, E::Rel8);
    table[0xE2] = op(Loop, E::Rel8);
    table[0xE3] = op(Jcxz, E::Rel8);
    table[0xE4] = op8(In, E::Acc_Port);
    table[0xE5] = op(In, E::Acc_Port);
    table[0xE6] = op8(Out, E::Port_Acc);
    table[0xE7] = op(Out, E::Port_Acc);
    table[0xE8] = op(Call, E::Rel16);
    table[0xE9] = op(Jmp, E::Rel16);
    table[0xEA] = op(JmpFar, E::FarPtr);
    table[0xEB] = op(Jmp, E::Rel8);
    table[0xEC] = op8(In, E::Acc_Dx);
    table[0xED] = op(In, E::Acc_Dx);
    table[0xEE] = op8(Out, E::Dx_Acc);
    table[0xEF] = op(Out, E::Dx_Acc);

    table[0xF4] = op(Hlt, E::None);
    table[0xF5] = op(Cmc, E::None);
    table[0xF8] = op(Clc, E::None);
    table[0xF9] = op(Stc, E::None);
    table[0xFA] = op(Cli, E::None);
    table[0xFB] = op(Sti, E::None);
    table[0xFC] = op(Cld, E::None);
    table[0xFD] = op(Std, E::None);

    table
};

/// Two-byte (`0F xx`) opcodes valid in real mode on a 386.
pub static OPCODE_TABLE_0F: [Option<OpcodeEntry>; 256] = {
    use Mnemonic::*;
    use OperandEncoding as E;

    let mut table: [Option<OpcodeEntry>; 256] = [NONE_ENTRY; 256];

    let mut cc = 0;
    while cc < 16 {
        table[0x80 + cc] = op(Jcc(Condition::from_code(cc as u8)), E::Rel16);
        cc += 1;
    }

    table[0xA0] = op(Push, E::Sreg(4));
    table[0xA1] = op(Pop, E::Sreg(4));
    table[0xA8] = op(Push, E::Sreg(5));
    table[0xA9] = op(Pop, E::Sreg(5));
    table[0xAF] = op(Imul, E::ModRmReg_Rm);
    table[0xB6] = op8(Movzx, E::ModRmReg_Rm);
    table[0xB7] = op(Movzx, E::ModRmReg_Rm);
    table[0xBE] = op8(Movsx, E::ModRmReg_Rm);
    table[0xBF] = op(Movsx, E::ModRmReg_Rm);

    table
};

/// Group 1 operations (0x80-0x83), selected by ModR/M reg.
pub static GROUP1_OPS: [Mnemonic; 8] = ALU_ROWS;

/// Group 2 shift/rotate operations (0xC0-0xC1, 0xD0-0xD3).
/// `/6` is the undocumented SAL alias of SHL.
pub static GROUP2_OPS: [Mnemonic; 8] = [
    Mnemonic::Rol,
    Mnemonic::Ror,
    Mnemonic::Rcl,
    Mnemonic::Rcr,
    Mnemonic::Shl,
    Mnemonic::Shr,
    Mnemonic::Shl,
    Mnemonic::Sar,
];

/// Group 3 operations (0xF6-0xF7). `/0` and `/1` take an immediate.
pub static GROUP3_OPS: [Mnemonic; 8] = [
    Mnemonic::Test,
    Mnemonic::Test,
    Mnemonic::Not,
    Mnemonic::Neg,
    Mnemonic::Mul,
    Mnemonic::Imul,
    Mnemonic::Div,
    Mnemonic::Idiv,
];

/// Group 5 operations (0xFF). `/7` is undefined.
pub static GROUP5_OPS: [Option<Mnemonic>; 8] = [
    Some(Mnemonic::Inc),
    Some(Mnemonic::Dec),
    Some(Mnemonic::Call),
    Some(Mnemonic::CallFar),
    Some(Mnemonic::Jmp),
    Some(Mnemonic::JmpFar),
    Some(Mnemonic::Push),
    None,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alu_rows() {
        for (base, mnemonic) in [(0x00usize, Mnemonic::Add), (0x38, Mnemonic::Cmp)] {
            for i in 0..6 {
                let entry = OPCODE_TABLE[base + i].unwrap();
                assert_eq!(entry.mnemonic, mnemonic);
                assert_eq!(entry.size, if i % 2 == 0 { 8 } else { 16 });
            }
        }
    }

    #[test]
    fn test_jcc_rows() {
        assert_eq!(
            OPCODE_TABLE[0x74].unwrap().mnemonic,
            Mnemonic::Jcc(Condition::Equal)
        );
        assert_eq!(
            OPCODE_TABLE_0F[0x8F].unwrap().mnemonic,
            Mnemonic::Jcc(Condition::Greater)
        );
    }

    #[test]
    fn test_prefix_and_group_bytes_are_not_in_table() {
        for byte in [0x26u8, 0x2E, 0x36, 0x3E, 0x66, 0x67, 0xF0, 0xF2, 0xF3, 0x80, 0xF6, 0xFF, 0xD8] {
            assert!(OPCODE_TABLE[byte as usize].is_none(), "{:#x}", byte);
        }
    }
}
