//! Explicit segment folding.
//!
//! `MOV r,imm; MOV ES,r` pins ES to a constant. Memory operands addressed
//! through ES are rewritten to that constant until a label, a control
//! transfer, an ES write or an implicit ES use ends the region. The loads
//! are then dropped where liveness shows nothing still reads them.

use tracing::debug;

use dosrec_core::{ControlFlow, Instruction, LinkFixup, Mnemonic, Operand, Register, SegmentBase};

use crate::dataflow::{InstructionEffects, Liveness};

pub(super) fn apply(mut instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut loads = Vec::new();
    for i in 0..instructions.len().saturating_sub(1) {
        let Some((reg, segment)) = segment_load(&instructions[i], &instructions[i + 1]) else {
            continue;
        };
        let folded = fold_forward(&mut instructions[i + 2..], segment);
        debug!(
            at = %instructions[i].address,
            value = format_args!("{:04X}", segment_value(segment)),
            folded,
            "folded ES load"
        );
        loads.push((i, reg));
    }
    if loads.is_empty() {
        return instructions;
    }

    let liveness = Liveness::new(&instructions);
    let mut remove = vec![false; instructions.len()];
    for (i, reg) in loads {
        if liveness.is_live_after(i + 1, Register::ES) {
            continue;
        }
        remove[i + 1] = true;
        if !liveness.is_live_after(i + 1, reg) {
            remove[i] = true;
        }
    }
    instructions
        .into_iter()
        .zip(remove)
        .filter_map(|(inst, removed)| (!removed).then_some(inst))
        .collect()
}

/// `MOV r,imm` directly followed by an unlabeled `MOV ES,r`.
fn segment_load(load: &Instruction, set: &Instruction) -> Option<(Register, SegmentBase)> {
    if load.mnemonic != Mnemonic::Mov || set.mnemonic != Mnemonic::Mov || set.is_label {
        return None;
    }
    let reg = load.op(0)?.as_register()?;
    let imm = match load.op(1)? {
        Operand::Immediate(imm) => imm,
        _ => return None,
    };
    if set.op(0)?.as_register()? != Register::ES || set.op(1)?.as_register()? != reg {
        return None;
    }
    Some((
        reg,
        SegmentBase::Immediate {
            value: imm.as_u16(),
            relocated: imm.fixup == Some(LinkFixup::Segment),
        },
    ))
}

fn fold_forward(region: &mut [Instruction], segment: SegmentBase) -> usize {
    let mut folded = 0;
    for inst in region {
        if inst.is_label || inst.control_flow() != ControlFlow::Sequential {
            break;
        }
        let effects = InstructionEffects::from_instruction(inst);
        let explicit = inst.operands.iter().any(addresses_es);
        if effects.reads_register(&Register::ES) && !explicit {
            break;
        }
        for op in &mut inst.operands {
            if let Operand::Memory(mem) = op {
                if mem.segment_register() == Some(Register::ES) {
                    mem.segment = segment;
                    folded += 1;
                }
            }
        }
        if effects.overwrites(&Register::ES) {
            break;
        }
    }
    folded
}

fn addresses_es(op: &Operand) -> bool {
    matches!(op, Operand::Memory(mem) if mem.segment_register() == Some(Register::ES))
}

fn segment_value(segment: SegmentBase) -> u16 {
    match segment {
        SegmentBase::Immediate { value, .. } => value,
        SegmentBase::Register(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::SegOff;
    use dosrec_disasm::{Decoder16, Disassembler};

    fn decode(bytes: &[u8]) -> Vec<Instruction> {
        Decoder16::new()
            .disassemble_block(bytes, SegOff::new(0, 0))
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_constant_es_is_folded() {
        #[rustfmt::skip]
        let body = decode(&[
            0xB8, 0x00, 0xB8,                   // mov ax, B800
            0x8E, 0xC0,                         // mov es, ax
            0x26, 0xC6, 0x06, 0x00, 0x00, 0x41, // mov byte es:[0000], 41
            0xC3,                               // ret
        ]);
        let out = apply(body);
        let mnemonics: Vec<_> = out.iter().map(|i| i.mnemonic).collect();
        // AX may carry the return value, so its load stays.
        assert_eq!(mnemonics, vec![Mnemonic::Mov, Mnemonic::Mov, Mnemonic::Ret]);
        let mem = out[1].op(0).and_then(Operand::as_memory).unwrap();
        assert_eq!(
            mem.segment,
            SegmentBase::Immediate {
                value: 0xB800,
                relocated: false
            }
        );
    }

    #[test]
    fn test_implicit_es_use_keeps_load() {
        #[rustfmt::skip]
        let body = decode(&[
            0xB8, 0x00, 0xB8,   // mov ax, B800
            0x8E, 0xC0,         // mov es, ax
            0xAA,               // stosb
            0xC3,               // ret
        ]);
        let out = apply(body);
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_dead_scratch_register_is_removed() {
        #[rustfmt::skip]
        let body = decode(&[
            0xBB, 0x00, 0xB8,                   // mov bx, B800
            0x8E, 0xC3,                         // mov es, bx
            0x26, 0xA1, 0x10, 0x00,             // mov ax, es:[0010]
            0xC3,                               // ret
        ]);
        let out = apply(body);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mnemonic, Mnemonic::Mov);
        let mem = out[0].op(1).and_then(Operand::as_memory).unwrap();
        assert!(mem.segment_register().is_none());
    }
}
