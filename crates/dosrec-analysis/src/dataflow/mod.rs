//! Register and segment dataflow over recovered function bodies.
//!
//! This module provides:
//! - Per-instruction read/write sets, including implicit operands of
//!   string, multiply/divide and flag instructions
//! - Path-based liveness queries used by the normalizer

pub mod liveness;

pub use liveness::Liveness;

use dosrec_core::{Instruction, MemoryRef, Mnemonic, Operand, Register};

/// Registers an instruction reads and unconditionally writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionEffects {
    /// Registers read, including address and segment registers of memory
    /// operands.
    pub reads: Vec<Register>,
    /// Registers written on every execution.
    pub writes: Vec<Register>,
}

const GENERAL: [Register; 8] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
];

impl InstructionEffects {
    /// Analyzes an instruction to determine its effects.
    pub fn from_instruction(inst: &Instruction) -> Self {
        use Mnemonic::*;

        let mut effects = Self::default();
        let ops = &inst.operands;
        let first = ops.first();
        let second = ops.get(1);

        match inst.mnemonic {
            Mov | Movsx | Movzx | In => {
                effects.def(first);
                effects.use_operand(second);
            }
            Lea => {
                effects.def(first);
                if let Some(Operand::Memory(mem)) = second {
                    effects.address(mem, false);
                }
            }
            Lds | Les => {
                effects.def(first);
                effects.use_operand(second);
                effects.writes.push(if inst.mnemonic == Lds {
                    Register::DS
                } else {
                    Register::ES
                });
            }
            Push => effects.use_operand(first),
            Pop => effects.def(first),
            Pusha => effects.reads.extend(GENERAL),
            Popa => effects
                .writes
                .extend(GENERAL.iter().copied().filter(|r| *r != Register::SP)),
            Pushf => effects.reads.push(Register::FLAGS),
            Popf => effects.writes.push(Register::FLAGS),
            Xchg | Bound | Out => {
                effects.use_operand(first);
                effects.use_operand(second);
                if inst.mnemonic == Xchg {
                    effects.def(first);
                    effects.def(second);
                }
            }
            Add | Sub | And | Or | Xor => {
                let zeroing = matches!(inst.mnemonic, Sub | Xor)
                    && matches!(
                        (first.and_then(Operand::as_register), second.and_then(Operand::as_register)),
                        (Some(a), Some(b)) if a == b
                    );
                if zeroing {
                    effects.def(first);
                } else {
                    effects.update(first);
                    effects.use_operand(second);
                }
                effects.writes.push(Register::FLAGS);
            }
            Adc | Sbb => {
                effects.update(first);
                effects.use_operand(second);
                effects.reads.push(Register::FLAGS);
                effects.writes.push(Register::FLAGS);
            }
            Cmp | Test => {
                effects.use_operand(first);
                effects.use_operand(second);
                effects.writes.push(Register::FLAGS);
            }
            Inc | Dec | Not => effects.update(first),
            Neg => {
                effects.update(first);
                effects.writes.push(Register::FLAGS);
            }
            Shl | Shr | Sar | Rol | Ror => {
                effects.update(first);
                effects.use_operand(second);
            }
            Rcl | Rcr => {
                effects.update(first);
                effects.use_operand(second);
                effects.reads.push(Register::FLAGS);
            }
            Mul | Imul | Div | Idiv if ops.len() == 1 => effects.multiply(inst),
            Imul => {
                if ops.len() == 2 {
                    effects.update(first);
                } else {
                    effects.def(first);
                }
                for op in &ops[1..] {
                    effects.use_operand(Some(op));
                }
                effects.writes.push(Register::FLAGS);
            }
            Mul | Div | Idiv => effects.multiply(inst),
            Cbw => {
                effects.reads.push(Register::AL);
                effects.writes.push(Register::AX);
            }
            Cwd => {
                effects.reads.push(Register::AX);
                effects.writes.push(Register::DX);
            }
            Lahf => {
                effects.reads.push(Register::FLAGS);
                effects.writes.push(Register::AH);
            }
            Sahf => effects.reads.push(Register::AH),
            Xlat => {
                effects.reads.push(Register::AL);
                effects.reads.push(Register::BX);
                effects
                    .reads
                    .push(inst.prefixes.segment.unwrap_or(Register::DS));
                effects.writes.push(Register::AL);
            }
            Daa | Das => {
                effects.reads.push(Register::AL);
                effects.reads.push(Register::FLAGS);
                effects.writes.push(Register::AL);
            }
            Aaa | Aas | Aam | Aad => {
                effects.reads.push(Register::AX);
                effects.writes.push(Register::AX);
            }

            Movsb | Movsw | Cmpsb | Cmpsw | Scasb | Scasw | Lodsb | Lodsw | Stosb | Stosw
            | Insb | Insw | Outsb | Outsw => effects.string(inst),

            Jcc(_) => effects.reads.push(Register::FLAGS),
            Loope | Loopne => {
                effects.reads.push(Register::FLAGS);
                effects.reads.push(Register::CX);
                effects.writes.push(Register::CX);
            }
            Loop => {
                effects.reads.push(Register::CX);
                effects.writes.push(Register::CX);
            }
            Jcxz => effects.reads.push(Register::CX),
            Jmp | JmpFar | Call | CallFar => effects.use_operand(first),
            Into | Cmc => effects.reads.push(Register::FLAGS),
            Int => {
                effects.reads.extend(GENERAL);
                effects.reads.push(Register::DS);
                effects.reads.push(Register::ES);
            }
            Enter | Leave => {
                effects.reads.push(Register::BP);
                effects.writes.push(Register::BP);
            }

            Fld | Fild | Fst | Fstp | Fist | Fistp | Fadd | Fsub | Fsubr | Fmul | Fdiv
            | Fdivr | Fcom | Fcomp | Fcompp | Fxch | Fchs | Fabs | Ftst | Fldz | Fld1
            | Fstcw | Fldcw | Finit | Fclex | Fpu => {
                for op in ops {
                    if let Operand::Memory(mem) = op {
                        effects.address(mem, true);
                    }
                }
            }
            Fstsw => match first {
                Some(Operand::Register(reg)) => effects.writes.push(*reg),
                Some(Operand::Memory(mem)) => effects.address(mem, true),
                _ => {}
            },

            Switch => effects.use_operand(first),
            If | IfAnd | IfOr => {
                effects.use_operand(first);
                effects.use_operand(second);
            }
            WordsToDword => {
                effects.def(first);
                effects.use_operand(second);
                effects.use_operand(ops.get(2));
            }
            PushAddress => {
                if let Some(Operand::Memory(mem)) = first {
                    effects.address(mem, false);
                }
            }

            Ret | Retf | Iret | CallOverlay | Clc | Stc | Cld | Std | Cli | Sti | Hlt | Wait
            | Nop => {}
        }

        effects
    }

    /// Returns true if any read overlaps `reg`.
    pub fn reads_register(&self, reg: &Register) -> bool {
        self.reads.iter().any(|r| r.overlaps(reg))
    }

    /// Returns true if a write replaces every lane of `reg`.
    pub fn overwrites(&self, reg: &Register) -> bool {
        self.writes.iter().any(|w| w.covers(reg))
    }

    fn address(&mut self, mem: &MemoryRef, with_segment: bool) {
        self.reads.extend_from_slice(mem.mode.registers());
        if with_segment {
            if let Some(segment) = mem.segment_register() {
                self.reads.push(segment);
            }
        }
    }

    fn use_operand(&mut self, op: Option<&Operand>) {
        match op {
            Some(Operand::Register(reg)) => self.reads.push(*reg),
            Some(Operand::Memory(mem)) => self.address(mem, true),
            _ => {}
        }
    }

    fn def(&mut self, op: Option<&Operand>) {
        match op {
            Some(Operand::Register(reg)) => self.writes.push(*reg),
            Some(Operand::Memory(mem)) => self.address(mem, true),
            _ => {}
        }
    }

    fn update(&mut self, op: Option<&Operand>) {
        self.use_operand(op);
        self.def(op);
    }

    fn multiply(&mut self, inst: &Instruction) {
        let source = inst.operands.first();
        self.use_operand(source);
        let width = match source {
            Some(Operand::Register(reg)) => reg.size,
            Some(Operand::Memory(mem)) => mem.size as u16 * 8,
            _ => 16,
        };
        let divide = matches!(inst.mnemonic, Mnemonic::Div | Mnemonic::Idiv);
        match width {
            8 => {
                self.reads
                    .push(if divide { Register::AX } else { Register::AL });
                self.writes.push(Register::AX);
            }
            32 => {
                self.reads.push(Register::EAX);
                if divide {
                    self.reads.push(Register::EDX);
                }
                self.writes.push(Register::EAX);
                self.writes.push(Register::EDX);
            }
            _ => {
                self.reads.push(Register::AX);
                if divide {
                    self.reads.push(Register::DX);
                }
                self.writes.push(Register::AX);
                self.writes.push(Register::DX);
            }
        }
    }

    fn string(&mut self, inst: &Instruction) {
        use Mnemonic::*;

        let source_segment = inst.prefixes.segment.unwrap_or(Register::DS);
        let acc = match inst.mnemonic {
            Scasb | Lodsb | Stosb => Register::AL,
            _ => Register::AX,
        };
        let (reads, writes): (Vec<Register>, Vec<Register>) = match inst.mnemonic {
            Movsb | Movsw => (
                vec![Register::SI, Register::DI, source_segment, Register::ES],
                vec![Register::SI, Register::DI],
            ),
            Cmpsb | Cmpsw => (
                vec![Register::SI, Register::DI, source_segment, Register::ES],
                vec![Register::SI, Register::DI, Register::FLAGS],
            ),
            Scasb | Scasw => (
                vec![acc, Register::DI, Register::ES],
                vec![Register::DI, Register::FLAGS],
            ),
            Lodsb | Lodsw => (vec![Register::SI, source_segment], vec![acc, Register::SI]),
            Stosb | Stosw => (vec![acc, Register::DI, Register::ES], vec![Register::DI]),
            Insb | Insw => (vec![Register::DX, Register::DI, Register::ES], vec![Register::DI]),
            _ => (vec![Register::DX, Register::SI, source_segment], vec![Register::SI]),
        };
        self.reads.extend(reads);
        if inst.prefixes.repeat.is_some() {
            // zero iterations leave everything but the counters untouched
            self.reads.push(Register::CX);
            self.writes.extend(
                writes
                    .into_iter()
                    .filter(|r| *r == Register::SI || *r == Register::DI),
            );
            self.writes.push(Register::CX);
        } else {
            self.writes.extend(writes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{Prefixes, RepeatPrefix, RmBase, SegOff};

    fn inst(mnemonic: Mnemonic, operands: Vec<Operand>) -> Instruction {
        Instruction::new(SegOff::new(0, 0), 2, mnemonic).with_operands(operands)
    }

    #[test]
    fn test_mov_reads_source_writes_destination() {
        let effects = InstructionEffects::from_instruction(&inst(
            Mnemonic::Mov,
            vec![Operand::reg(Register::AX), Operand::reg(Register::BX)],
        ));
        assert!(effects.reads_register(&Register::BX));
        assert!(!effects.reads_register(&Register::AX));
        assert!(effects.overwrites(&Register::AX));
        assert!(effects.overwrites(&Register::AH));
    }

    #[test]
    fn test_byte_write_does_not_kill_word() {
        let effects = InstructionEffects::from_instruction(&inst(
            Mnemonic::Mov,
            vec![Operand::reg(Register::AL), Operand::imm(1, 8)],
        ));
        assert!(!effects.overwrites(&Register::AX));
        assert!(effects.overwrites(&Register::AL));
    }

    #[test]
    fn test_self_xor_does_not_read() {
        let effects = InstructionEffects::from_instruction(&inst(
            Mnemonic::Xor,
            vec![Operand::reg(Register::AX), Operand::reg(Register::AX)],
        ));
        assert!(!effects.reads_register(&Register::AX));
        assert!(effects.overwrites(&Register::AX));
    }

    #[test]
    fn test_memory_store_reads_address_and_segment() {
        let mem = MemoryRef::based(RmBase::BxSi, 2, 2).with_segment(Register::ES);
        let effects = InstructionEffects::from_instruction(&inst(
            Mnemonic::Mov,
            vec![Operand::Memory(mem), Operand::reg(Register::CX)],
        ));
        for reg in [Register::BX, Register::SI, Register::ES, Register::CX] {
            assert!(effects.reads_register(&reg), "{reg} not read");
        }
        assert!(effects.writes.is_empty());
    }

    #[test]
    fn test_rep_string_reads_counter_and_segments() {
        let mut movs = inst(Mnemonic::Movsw, vec![]);
        movs.prefixes = Prefixes {
            repeat: Some(RepeatPrefix::Rep),
            ..Prefixes::default()
        };
        let effects = InstructionEffects::from_instruction(&movs);
        for reg in [Register::CX, Register::SI, Register::DI, Register::DS, Register::ES] {
            assert!(effects.reads_register(&reg));
        }
        assert!(effects.overwrites(&Register::CX));
    }

    #[test]
    fn test_word_divide_uses_dx() {
        let effects = InstructionEffects::from_instruction(&inst(
            Mnemonic::Div,
            vec![Operand::reg(Register::BX)],
        ));
        assert!(effects.reads_register(&Register::DX));
        assert!(effects.overwrites(&Register::DX));
        assert!(effects.overwrites(&Register::AX));
    }
}
