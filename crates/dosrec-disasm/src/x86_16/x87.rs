//! x87 FPU instruction decoding.
//!
//! x87 FPU instructions use escape opcodes 0xD8-0xDF.
//! The encoding depends on both the escape byte and the ModR/M byte:
//! - When ModR/M < 0xC0: memory operand, reg field (bits 5:3) selects the instruction
//! - When ModR/M >= 0xC0: register operand ST(i), different instruction table
//!
//! Forms outside the common subset decode as the generic `esc` mnemonic
//! carrying the raw escape word, so their length is still exact.

use dosrec_core::{Mnemonic, Operand, Register};

use super::modrm::ModRM;

/// x87 memory-form entry: mnemonic and memory operand size in bytes.
#[derive(Clone, Copy)]
pub struct X87Entry {
    pub mnemonic: Mnemonic,
    pub mem_size: u8,
}

const fn mem(mnemonic: Mnemonic, mem_size: u8) -> X87Entry {
    X87Entry { mnemonic, mem_size }
}

const fn esc(mem_size: u8) -> X87Entry {
    X87Entry {
        mnemonic: Mnemonic::Fpu,
        mem_size,
    }
}

/// D8 /r memory: single-precision arithmetic
static X87_D8_MEM: [X87Entry; 8] = [
    mem(Mnemonic::Fadd, 4),
    mem(Mnemonic::Fmul, 4),
    mem(Mnemonic::Fcom, 4),
    mem(Mnemonic::Fcomp, 4),
    mem(Mnemonic::Fsub, 4),
    mem(Mnemonic::Fsubr, 4),
    mem(Mnemonic::Fdiv, 4),
    mem(Mnemonic::Fdivr, 4),
];

/// D9 /r memory: single-precision load/store, control word
static X87_D9_MEM: [X87Entry; 8] = [
    mem(Mnemonic::Fld, 4),
    esc(4),
    mem(Mnemonic::Fst, 4),
    mem(Mnemonic::Fstp, 4),
    esc(14), // fldenv
    mem(Mnemonic::Fldcw, 2),
    esc(14), // fnstenv
    mem(Mnemonic::Fstcw, 2),
];

/// DB /r memory: 32-bit integer and extended-precision load/store
static X87_DB_MEM: [X87Entry; 8] = [
    mem(Mnemonic::Fild, 4),
    esc(4),
    mem(Mnemonic::Fist, 4),
    mem(Mnemonic::Fistp, 4),
    esc(10),
    mem(Mnemonic::Fld, 10),
    esc(10),
    mem(Mnemonic::Fstp, 10),
];

/// DD /r memory: double-precision load/store, state, status word
static X87_DD_MEM: [X87Entry; 8] = [
    mem(Mnemonic::Fld, 8),
    esc(8),
    mem(Mnemonic::Fst, 8),
    mem(Mnemonic::Fstp, 8),
    esc(94), // frstor
    esc(8),
    esc(94), // fnsave
    mem(Mnemonic::Fstsw, 2),
];

/// DF /r memory: 16/64-bit integer load/store, packed BCD
static X87_DF_MEM: [X87Entry; 8] = [
    mem(Mnemonic::Fild, 2),
    esc(2),
    mem(Mnemonic::Fist, 2),
    mem(Mnemonic::Fistp, 2),
    esc(10), // fbld
    mem(Mnemonic::Fild, 8),
    esc(10), // fbstp
    mem(Mnemonic::Fistp, 8),
];

fn memory_entry(escape: u8, reg: u8) -> X87Entry {
    let reg = (reg & 7) as usize;
    match escape {
        0xD8 => X87_D8_MEM[reg],
        0xD9 => X87_D9_MEM[reg],
        // DA: 32-bit integer arithmetic
        0xDA => esc(4),
        0xDB => X87_DB_MEM[reg],
        0xDC => {
            let entry = X87_D8_MEM[reg];
            mem(entry.mnemonic, 8)
        }
        0xDD => X87_DD_MEM[reg],
        // DE: 16-bit integer arithmetic
        0xDE => esc(2),
        _ => X87_DF_MEM[reg],
    }
}

fn st(i: u8) -> Operand {
    Operand::FpuStack(i)
}

fn raw(escape: u8, modrm: u8) -> Operand {
    Operand::imm(((escape as i32) << 8) | modrm as i32, 16)
}

/// Register-form (ModR/M >= 0xC0) instructions.
fn register_form(escape: u8, modrm_byte: u8) -> (Mnemonic, Vec<Operand>) {
    let modrm = ModRM::parse(modrm_byte);
    let i = modrm.rm;
    match (escape, modrm.reg) {
        (0xD8, reg) => {
            let mnemonic = X87_D8_MEM[reg as usize].mnemonic;
            (mnemonic, vec![st(0), st(i)])
        }
        (0xD9, 0) => (Mnemonic::Fld, vec![st(i)]),
        (0xD9, 1) => (Mnemonic::Fxch, vec![st(i)]),
        (0xD9, _) => match modrm_byte {
            0xE0 => (Mnemonic::Fchs, vec![]),
            0xE1 => (Mnemonic::Fabs, vec![]),
            0xE4 => (Mnemonic::Ftst, vec![]),
            0xE8 => (Mnemonic::Fld1, vec![]),
            0xEE => (Mnemonic::Fldz, vec![]),
            _ => (Mnemonic::Fpu, vec![raw(escape, modrm_byte)]),
        },
        (0xDB, _) => match modrm_byte {
            0xE2 => (Mnemonic::Fclex, vec![]),
            0xE3 => (Mnemonic::Finit, vec![]),
            _ => (Mnemonic::Fpu, vec![raw(escape, modrm_byte)]),
        },
        (0xDC, reg) => {
            let mnemonic = X87_D8_MEM[reg as usize].mnemonic;
            (mnemonic, vec![st(i), st(0)])
        }
        (0xDD, 2) => (Mnemonic::Fst, vec![st(i)]),
        (0xDD, 3) => (Mnemonic::Fstp, vec![st(i)]),
        (0xDE, 3) if modrm_byte == 0xD9 => (Mnemonic::Fcompp, vec![]),
        (0xDF, 4) if modrm_byte == 0xE0 => (Mnemonic::Fstsw, vec![Operand::reg(Register::AX)]),
        _ => (Mnemonic::Fpu, vec![raw(escape, modrm_byte)]),
    }
}

/// Decodes an x87 instruction after its escape byte.
///
/// `bytes` starts at the ModR/M byte. Returns the mnemonic, operands and the
/// number of bytes consumed from `bytes`, or `None` if truncated.
pub fn decode_x87(
    escape: u8,
    bytes: &[u8],
    prefixes: &dosrec_core::Prefixes,
) -> Option<(Mnemonic, Vec<Operand>, usize)> {
    let modrm_byte = *bytes.first()?;
    let modrm = ModRM::parse(modrm_byte);

    if modrm.is_register() {
        let (mnemonic, operands) = register_form(escape, modrm_byte);
        return Some((mnemonic, operands, 1));
    }

    let entry = memory_entry(escape, modrm.reg);
    let (operand, consumed) =
        super::modrm::decode_modrm_rm(&bytes[1..], modrm, prefixes, entry.mem_size as u16 * 8)?;
    let operands = if entry.mnemonic == Mnemonic::Fpu {
        vec![raw(escape, modrm_byte), operand]
    } else {
        vec![operand]
    };
    Some((entry.mnemonic, operands, 1 + consumed))
}
