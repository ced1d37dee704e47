//! Implicit far-call reconstruction.
//!
//! `CALL rel16` gets an absolute `CS:target` operand. When it directly
//! follows `PUSH CS` the pair is a far call compiled as a near one: the
//! push is absorbed and the call becomes `CALL FAR`.

use dosrec_core::{FarPointer, Instruction, Mnemonic, Operand, Register};

pub(super) fn apply(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut output: Vec<Instruction> = Vec::with_capacity(instructions.len());
    for mut inst in instructions {
        let target = match (inst.mnemonic, inst.op(0)) {
            (Mnemonic::Call, Some(Operand::Relative { target, .. })) => *target,
            _ => {
                output.push(inst);
                continue;
            }
        };
        inst.operands[0] = Operand::FarPointer(FarPointer {
            segment: inst.address.segment,
            offset: target,
            relocated: false,
        });

        let pushes_cs = output
            .last()
            .is_some_and(|prev| pushes_code_segment(prev) && prev.end_offset() == inst.offset());
        if pushes_cs && !inst.is_label {
            if let Some(push) = output.pop() {
                inst.mnemonic = Mnemonic::CallFar;
                inst.address = push.address;
                inst.size = inst.size.saturating_add(push.size);
                inst.is_label = push.is_label;
            }
        }
        output.push(inst);
    }
    output
}

fn pushes_code_segment(inst: &Instruction) -> bool {
    inst.mnemonic == Mnemonic::Push && inst.op(0).and_then(Operand::as_register) == Some(Register::CS)
}
