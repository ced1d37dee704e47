//! Goto collapse.

use std::collections::{HashMap, HashSet};

use dosrec_core::{Instruction, Mnemonic, Operand};

use super::displacement_to;

pub(super) fn apply(mut instructions: Vec<Instruction>) -> Vec<Instruction> {
    let jumps: HashMap<u16, u16> = instructions
        .iter()
        .filter_map(|inst| Some((inst.offset(), direct_target(inst)?)))
        .collect();

    for inst in instructions.iter_mut() {
        let Some(target) = direct_target(inst) else {
            continue;
        };
        let last = final_target(&jumps, target);
        if last != target {
            let displacement = displacement_to(inst, last);
            inst.operands[0] = Operand::relative(displacement, last);
        }
    }

    let mut output = Vec::with_capacity(instructions.len());
    let mut iter = instructions.into_iter().peekable();
    while let Some(inst) = iter.next() {
        let to_next = match (direct_target(&inst), iter.peek()) {
            (Some(target), Some(next)) => target == next.offset(),
            _ => false,
        };
        if to_next && !inst.is_label {
            continue;
        }
        output.push(inst);
    }
    output
}

/// Follows a chain of unconditional jumps, stopping on a cycle.
fn final_target(jumps: &HashMap<u16, u16>, start: u16) -> u16 {
    let mut seen = HashSet::new();
    let mut target = start;
    seen.insert(target);
    while let Some(&next) = jumps.get(&target) {
        if !seen.insert(next) {
            break;
        }
        target = next;
    }
    target
}

fn direct_target(inst: &Instruction) -> Option<u16> {
    if inst.mnemonic != Mnemonic::Jmp || inst.synthetic {
        return None;
    }
    match inst.op(0)? {
        Operand::Relative { target, .. } => Some(*target),
        _ => None,
    }
}
