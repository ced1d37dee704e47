//! `XOR r,r` / `SUB r,r` to `MOV r,0`.

use dosrec_core::{Instruction, Mnemonic, Operand};

pub(super) fn apply(mut instructions: Vec<Instruction>) -> Vec<Instruction> {
    for i in 0..instructions.len() {
        let inst = &instructions[i];
        if !matches!(inst.mnemonic, Mnemonic::Xor | Mnemonic::Sub) {
            continue;
        }
        let reg = match (inst.op(0), inst.op(1)) {
            (Some(Operand::Register(a)), Some(Operand::Register(b))) if a == b => *a,
            _ => continue,
        };
        // The flags are still consumed.
        if instructions
            .get(i + 1)
            .is_some_and(|next| next.mnemonic.reads_flags_for_branch())
        {
            continue;
        }
        let inst = &mut instructions[i];
        inst.mnemonic = Mnemonic::Mov;
        inst.operands = vec![Operand::reg(reg), Operand::imm(0, reg.size as u8)];
    }
    instructions
}
