//! `LEA r,m; PUSH r` to PUSH-ADDRESS, when `r` is dead afterwards.

use dosrec_core::{Instruction, Mnemonic, Operand};

use crate::dataflow::Liveness;

pub(super) fn apply(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let liveness = Liveness::new(&instructions);
    let mut output = Vec::with_capacity(instructions.len());
    let mut i = 0;
    while i < instructions.len() {
        let lea = &instructions[i];
        let fused = instructions.get(i + 1).and_then(|push| {
            let (reg, mem) = match (lea.mnemonic, lea.op(0), lea.op(1)) {
                (Mnemonic::Lea, Some(Operand::Register(reg)), Some(Operand::Memory(mem))) => {
                    (*reg, mem)
                }
                _ => return None,
            };
            let pushes_reg = push.mnemonic == Mnemonic::Push
                && push.op(0).and_then(Operand::as_register) == Some(reg);
            if !pushes_reg || push.is_label || liveness.is_live_after(i + 1, reg) {
                return None;
            }
            let size = lea.size.checked_add(push.size)?;
            let mut inst = Instruction::new(lea.address, size, Mnemonic::PushAddress)
                .with_operand(Operand::Memory(mem.clone()));
            inst.synthetic = true;
            inst.is_label = lea.is_label;
            Some(inst)
        });
        match fused {
            Some(inst) => {
                output.push(inst);
                i += 2;
            }
            None => {
                output.push(lea.clone());
                i += 1;
            }
        }
    }
    output
}
