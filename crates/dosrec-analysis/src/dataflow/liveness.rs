//! Liveness queries.
//!
//! Unlike a block-level fixpoint, a query walks forward from one position
//! along every reachable path and stops each path at the first read of the
//! register (live), the first full overwrite (dead on that path), or a
//! call/return boundary. The answer is the disjunction over all paths.
//!
//! Calls are assumed to clobber every register except SI, DI, BP, SP and
//! the DS/SS/CS segment registers, which the calling convention preserves.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use dosrec_core::{ControlFlow, Instruction, Register};

use super::InstructionEffects;

/// Forward liveness over one function's address-ordered instructions.
pub struct Liveness<'a> {
    instructions: &'a [Instruction],
    index: HashMap<u16, usize>,
}

enum Step {
    Next(usize),
    Stop,
    Live,
}

impl<'a> Liveness<'a> {
    pub fn new(instructions: &'a [Instruction]) -> Self {
        let index = instructions
            .iter()
            .enumerate()
            .map(|(idx, inst)| (inst.offset(), idx))
            .collect();
        Self {
            instructions,
            index,
        }
    }

    /// Returns true if `reg` may be read after the instruction at
    /// `position` before being overwritten.
    pub fn is_live_after(&self, position: usize, reg: Register) -> bool {
        if position >= self.instructions.len() {
            return false;
        }

        let mut pending = Vec::new();
        let mut visited = HashSet::new();
        match self.advance(position, &reg, &mut pending) {
            Step::Live => return true,
            Step::Next(next) => pending.push(next),
            Step::Stop => {}
        }

        while let Some(start) = pending.pop() {
            if !visited.insert(start) {
                continue;
            }
            let mut idx = start;
            loop {
                let effects = InstructionEffects::from_instruction(&self.instructions[idx]);
                if effects.reads_register(&reg) {
                    return true;
                }
                if effects.overwrites(&reg) {
                    break;
                }
                match self.advance(idx, &reg, &mut pending) {
                    Step::Next(next) => idx = next,
                    Step::Stop => break,
                    Step::Live => return true,
                }
            }
        }

        false
    }

    /// Index of the instruction at `offset`.
    pub fn index_of(&self, offset: u16) -> Option<usize> {
        self.index.get(&offset).copied()
    }

    /// Moves past the instruction at `idx`: schedules branch targets and
    /// returns where straight-line execution continues.
    fn advance(&self, idx: usize, reg: &Register, pending: &mut Vec<usize>) -> Step {
        let inst = &self.instructions[idx];
        match inst.control_flow() {
            ControlFlow::Sequential => self.fall_through(idx, reg),
            ControlFlow::ConditionalBranch { target, .. } => {
                if !self.schedule(target, pending) {
                    debug!(offset = inst.offset(), %reg, "branch leaves function, assuming live");
                    return Step::Live;
                }
                self.fall_through(idx, reg)
            }
            ControlFlow::Jump { target } => {
                if self.schedule(target, pending) {
                    Step::Stop
                } else {
                    debug!(offset = inst.offset(), %reg, "jump leaves function, assuming live");
                    Step::Live
                }
            }
            ControlFlow::Switch { targets } => {
                for target in targets {
                    if !self.schedule(target, pending) {
                        return Step::Live;
                    }
                }
                Step::Stop
            }
            ControlFlow::IndirectJump => {
                debug!(offset = inst.offset(), %reg, "unresolved indirect jump, assuming live");
                Step::Live
            }
            ControlFlow::Call { .. } | ControlFlow::IndirectCall { .. } => {
                if preserved_across_calls(reg) {
                    self.fall_through(idx, reg)
                } else {
                    Step::Stop
                }
            }
            ControlFlow::Return | ControlFlow::FarJump { .. } => {
                if preserved_across_calls(reg) || carries_return_value(reg) {
                    Step::Live
                } else {
                    Step::Stop
                }
            }
            ControlFlow::Exit | ControlFlow::Halt => Step::Stop,
        }
    }

    fn fall_through(&self, idx: usize, reg: &Register) -> Step {
        let end = self.instructions[idx].end_offset();
        match self.instructions.get(idx + 1) {
            Some(next) if next.offset() == end => Step::Next(idx + 1),
            _ => match self.index_of(end) {
                Some(next) => Step::Next(next),
                None => {
                    debug!(offset = end, %reg, "path runs off the recovered body, assuming live");
                    Step::Live
                }
            },
        }
    }

    fn schedule(&self, target: u16, pending: &mut Vec<usize>) -> bool {
        match self.index_of(target) {
            Some(idx) => {
                pending.push(idx);
                true
            }
            None => false,
        }
    }
}

fn preserved_across_calls(reg: &Register) -> bool {
    [
        Register::SI,
        Register::DI,
        Register::BP,
        Register::SP,
        Register::DS,
        Register::SS,
        Register::CS,
    ]
    .iter()
    .any(|preserved| preserved.overlaps(reg))
}

fn carries_return_value(reg: &Register) -> bool {
    Register::AX.overlaps(reg) || Register::DX.overlaps(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{Condition, Mnemonic, Operand, SegOff};

    fn at(offset: u16, size: u8, mnemonic: Mnemonic, operands: Vec<Operand>) -> Instruction {
        Instruction::new(SegOff::new(0, offset), size, mnemonic).with_operands(operands)
    }

    fn mov_imm(offset: u16, reg: Register) -> Instruction {
        at(offset, 3, Mnemonic::Mov, vec![Operand::reg(reg), Operand::imm(1, 16)])
    }

    fn ret(offset: u16) -> Instruction {
        at(offset, 1, Mnemonic::Ret, vec![])
    }

    #[test]
    fn test_overwritten_before_read_is_dead() {
        let body = vec![mov_imm(0, Register::BX), mov_imm(3, Register::BX), ret(6)];
        let liveness = Liveness::new(&body);
        assert!(!liveness.is_live_after(0, Register::BX));
    }

    #[test]
    fn test_read_on_one_branch_is_live() {
        // 0: mov bx,1 ; 3: je 8 ; 5: mov bx,1 ; 8: push bx ; 9: ret
        let body = vec![
            mov_imm(0, Register::BX),
            at(3, 2, Mnemonic::Jcc(Condition::Equal), vec![Operand::relative(3, 8)]),
            mov_imm(5, Register::BX),
            at(8, 1, Mnemonic::Push, vec![Operand::reg(Register::BX)]),
            ret(9),
        ];
        let liveness = Liveness::new(&body);
        assert!(liveness.is_live_after(0, Register::BX));
        assert!(!liveness.is_live_after(8, Register::BX));
    }

    #[test]
    fn test_high_byte_read_keeps_word_live() {
        let body = vec![
            mov_imm(0, Register::CX),
            at(3, 2, Mnemonic::Mov, vec![Operand::reg(Register::AL), Operand::reg(Register::CH)]),
            ret(5),
        ];
        let liveness = Liveness::new(&body);
        assert!(liveness.is_live_after(0, Register::CX));
    }

    #[test]
    fn test_call_clobbers_scratch_but_not_si() {
        let call = |offset: u16| {
            at(
                offset,
                3,
                Mnemonic::Call,
                vec![Operand::relative(0x20, offset.wrapping_add(0x23))],
            )
        };
        let body = vec![
            call(0),
            at(3, 1, Mnemonic::Push, vec![Operand::reg(Register::SI)]),
            at(4, 1, Mnemonic::Push, vec![Operand::reg(Register::ES)]),
            ret(5),
        ];
        let liveness = Liveness::new(&body);
        assert!(liveness.is_live_after(0, Register::SI));
        // ES read after the call sees the callee's value, not ours
        let mut with_load = vec![mov_imm(0, Register::AX)];
        with_load.extend(body.iter().cloned().map(|mut inst| {
            inst.address.offset += 3;
            inst
        }));
        assert!(!Liveness::new(&with_load).is_live_after(0, Register::AX));
    }

    #[test]
    fn test_loop_terminates() {
        // 0: mov bx,1 ; 3: jmp 3
        let body = vec![
            mov_imm(0, Register::BX),
            at(3, 2, Mnemonic::Jmp, vec![Operand::relative(-2, 3)]),
        ];
        let liveness = Liveness::new(&body);
        assert!(!liveness.is_live_after(0, Register::AX));
    }

    #[test]
    fn test_return_value_is_live_at_ret() {
        let body = vec![mov_imm(0, Register::AX), ret(3)];
        let liveness = Liveness::new(&body);
        assert!(liveness.is_live_after(0, Register::AX));
        assert!(!liveness.is_live_after(0, Register::BX));
    }
}
