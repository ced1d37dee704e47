//! `PUSH hi; PUSH lo; POP r32` to WORDS-TO-DWORD.

use dosrec_core::{Instruction, Mnemonic, Operand};

pub(super) fn apply(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut output = Vec::with_capacity(instructions.len());
    let mut i = 0;
    while i < instructions.len() {
        if let Some(fused) = fuse(&instructions[i..]) {
            output.push(fused);
            i += 3;
        } else {
            output.push(instructions[i].clone());
            i += 1;
        }
    }
    output
}

fn fuse(window: &[Instruction]) -> Option<Instruction> {
    let [high, low, pop, ..] = window else {
        return None;
    };
    if low.is_label || pop.is_label {
        return None;
    }
    if high.mnemonic != Mnemonic::Push || low.mnemonic != Mnemonic::Push || pop.mnemonic != Mnemonic::Pop {
        return None;
    }
    let dst = pop.op(0)?.as_register()?;
    if dst.size != 32 || !is_word(high.op(0)?) || !is_word(low.op(0)?) {
        return None;
    }
    let size = high.size.checked_add(low.size)?.checked_add(pop.size)?;
    let mut fused = Instruction::new(high.address, size, Mnemonic::WordsToDword).with_operands(vec![
        Operand::reg(dst),
        high.op(0)?.clone(),
        low.op(0)?.clone(),
    ]);
    fused.synthetic = true;
    fused.is_label = high.is_label;
    Some(fused)
}

fn is_word(op: &Operand) -> bool {
    match op {
        Operand::Register(reg) => reg.size == 16,
        Operand::Memory(mem) => mem.size == 2,
        Operand::Immediate(_) => true,
        _ => false,
    }
}
