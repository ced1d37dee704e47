//! Compare-and-branch fusion into IF, IF-AND and IF-OR.
//!
//! A comparison followed by unlabeled conditional branches is rewritten
//! branch by branch. Two adjacent branches to one target form an IF-OR;
//! `jcc1 NEXT; jcc2 T; NEXT:` forms an IF-AND of the inverted first
//! condition and the second. Every other branch becomes its own IF on the
//! shared operands. The first pseudo-instruction takes over the compare's
//! address. A chain followed by another flag reader (a labeled branch
//! reached from elsewhere) is left unfused so the compare stays visible.

use dosrec_core::{Condition, Instruction, Mnemonic, Operand};

use super::displacement_to;

pub(super) fn apply(instructions: Vec<Instruction>) -> Vec<Instruction> {
    let mut output = Vec::with_capacity(instructions.len());
    let mut i = 0;
    while i < instructions.len() {
        let compare = &instructions[i];
        let Some((a, b)) = comparison(compare) else {
            output.push(compare.clone());
            i += 1;
            continue;
        };
        let mut end = i + 1;
        while end < instructions.len() && branch(&instructions[end]).is_some() {
            end += 1;
        }
        // a labeled branch after the chain still reads the compare's flags
        let flags_read_later = instructions
            .get(end)
            .is_some_and(|next| next.mnemonic.reads_flags_for_branch());
        if end == i + 1 || flags_read_later {
            output.extend_from_slice(&instructions[i..end]);
            i = end;
            continue;
        }

        let chain = &instructions[i + 1..end];
        let after = instructions.get(end).map(Instruction::offset);
        let mut k = 0;
        while k < chain.len() {
            let Some((c1, t1)) = branch(&chain[k]) else {
                break;
            };
            let second = chain.get(k + 1).and_then(branch);
            let next = chain.get(k + 2).map(Instruction::offset).or(after);
            let (mnemonic, conditions, target, consumed) = match second {
                Some((c2, t2)) if t1 == t2 => (Mnemonic::IfOr, vec![c1, c2], t1, 2),
                Some((c2, t2)) if Some(t1) == next => {
                    (Mnemonic::IfAnd, vec![c1.inverse(), c2], t2, 2)
                }
                _ => (Mnemonic::If, vec![c1], t1, 1),
            };

            let head = if k == 0 { compare } else { &chain[k] };
            let last = &chain[k + consumed - 1];
            let size = last.end_offset().wrapping_sub(head.offset()) as u8;
            let mut fused = Instruction::new(head.address, size, mnemonic);
            fused.operands.push(a.clone());
            fused.operands.push(b.clone());
            fused
                .operands
                .extend(conditions.into_iter().map(Operand::Condition));
            let displacement = displacement_to(&fused, target);
            fused.operands.push(Operand::relative(displacement, target));
            fused.synthetic = true;
            fused.is_label = head.is_label;
            output.push(fused);
            k += consumed;
        }
        i = end;
    }
    output
}

/// Operands compared: `CMP a,b`, or `TEST r,r` / `OR r,r` against zero.
fn comparison(inst: &Instruction) -> Option<(Operand, Operand)> {
    match inst.mnemonic {
        Mnemonic::Cmp => Some((inst.op(0)?.clone(), inst.op(1)?.clone())),
        Mnemonic::Test | Mnemonic::Or => {
            let reg = inst.op(0)?.as_register()?;
            if inst.op(1)?.as_register()? != reg {
                return None;
            }
            Some((Operand::reg(reg), Operand::imm(0, reg.size as u8)))
        }
        _ => None,
    }
}

/// Condition and target of an unlabeled `Jcc`.
fn branch(inst: &Instruction) -> Option<(Condition, u16)> {
    if inst.is_label {
        return None;
    }
    let Mnemonic::Jcc(condition) = inst.mnemonic else {
        return None;
    };
    match inst.op(0)? {
        Operand::Relative { target, .. } => Some((condition, *target)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{Register, SegOff};

    fn cmp_ax(value: i32) -> Instruction {
        Instruction::new(SegOff::new(0, 0), 3, Mnemonic::Cmp)
            .with_operands(vec![Operand::reg(Register::AX), Operand::imm(value, 16)])
    }

    fn jcc(offset: u16, condition: Condition, target: u16) -> Instruction {
        Instruction::new(SegOff::new(0, offset), 2, Mnemonic::Jcc(condition))
            .with_operand(Operand::relative(target.wrapping_sub(offset + 2) as i16, target))
    }

    fn ret(offset: u16) -> Instruction {
        Instruction::new(SegOff::new(0, offset), 1, Mnemonic::Ret)
    }

    fn conditions(inst: &Instruction) -> Vec<Condition> {
        inst.operands
            .iter()
            .filter_map(|op| match op {
                Operand::Condition(c) => Some(*c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_branch() {
        let out = apply(vec![cmp_ax(5), jcc(3, Condition::Less, 0x20), ret(5)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mnemonic, Mnemonic::If);
        assert_eq!(out[0].offset(), 0);
        assert_eq!(out[0].end_offset(), 5);
        assert_eq!(conditions(&out[0]), vec![Condition::Less]);
        assert_eq!(out[0].branch_targets(), vec![0x20]);
        assert_eq!(out[0].op(1), Some(&Operand::imm(5, 16)));
    }

    #[test]
    fn test_same_target_is_or() {
        let out = apply(vec![
            cmp_ax(5),
            jcc(3, Condition::Equal, 0x20),
            jcc(5, Condition::Less, 0x20),
            ret(7),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mnemonic, Mnemonic::IfOr);
        assert_eq!(conditions(&out[0]), vec![Condition::Equal, Condition::Less]);
    }

    #[test]
    fn test_skip_over_branch_is_and() {
        let out = apply(vec![
            cmp_ax(5),
            jcc(3, Condition::Less, 7),
            jcc(5, Condition::Greater, 0x20),
            ret(7),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].mnemonic, Mnemonic::IfAnd);
        assert_eq!(
            conditions(&out[0]),
            vec![Condition::GreaterOrEqual, Condition::Greater]
        );
        assert_eq!(out[0].branch_targets(), vec![0x20]);
    }

    #[test]
    fn test_chain_shares_operands() {
        let out = apply(vec![
            cmp_ax(5),
            jcc(3, Condition::Equal, 0x20),
            jcc(5, Condition::Less, 0x30),
            ret(7),
        ]);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].mnemonic, Mnemonic::If);
        assert_eq!(out[1].mnemonic, Mnemonic::If);
        assert_eq!(out[1].offset(), 5);
        assert_eq!(out[0].op(0), out[1].op(0));
        assert_eq!(out[1].branch_targets(), vec![0x30]);
    }

    #[test]
    fn test_self_or_compares_against_zero() {
        let or = Instruction::new(SegOff::new(0, 0), 2, Mnemonic::Or)
            .with_operands(vec![Operand::reg(Register::DX), Operand::reg(Register::DX)]);
        let out = apply(vec![or, jcc(2, Condition::NotEqual, 0x20), ret(4)]);
        assert_eq!(out[0].mnemonic, Mnemonic::If);
        assert_eq!(out[0].op(1), Some(&Operand::imm(0, 16)));
    }

    #[test]
    fn test_chain_before_labeled_branch_keeps_compare() {
        let mut joined = jcc(5, Condition::Greater, 0x30);
        joined.is_label = true;
        let out = apply(vec![cmp_ax(5), jcc(3, Condition::Equal, 0x20), joined, ret(7)]);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].mnemonic, Mnemonic::Cmp);
        assert_eq!(out[1].mnemonic, Mnemonic::Jcc(Condition::Equal));
        assert_eq!(out[2].mnemonic, Mnemonic::Jcc(Condition::Greater));
        assert!(out[2].is_label);
    }

    #[test]
    fn test_labeled_branch_is_not_fused() {
        let mut branch = jcc(3, Condition::Less, 0x20);
        branch.is_label = true;
        let out = apply(vec![cmp_ax(5), branch, ret(5)]);
        assert_eq!(out[0].mnemonic, Mnemonic::Cmp);
    }
}
