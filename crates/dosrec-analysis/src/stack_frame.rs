//! BP-frame detection and stack-variable classification.
//!
//! With a frame in place, BP-relative accesses through SS split into
//! three areas:
//!
//! ```text
//!   [bp + 6 ..]             parameters
//!   [bp - 1 .. bp + 5]      saved BP and return address
//!   [bp - S - 2 .. bp - 3]  locals   (S = reserved local size)
//! ```
//!
//! A parameter's position is measured from the end of the return address,
//! so it depends on the call distance: `[bp+6]` is position 0 in a far
//! function and position 2 in a near one. A local's position is
//! `S - |d| + 2` and must lie below `S`.
//!
//! Each distinct displacement maps to one variable. An access that adds an
//! index register marks the variable as an array.

use tracing::warn;

use dosrec_core::{
    CallingConvention, CodeAddress, Instruction, Mnemonic, Operand, Register, StackFrame,
    Variable, VariableKind, VariableRef,
};

/// Lowest BP displacement treated as a parameter.
const FIRST_PARAMETER: i16 = 6;

/// Highest BP displacement treated as a local.
const LAST_LOCAL: i16 = -2;

/// Classifies the frame accesses of one function.
pub struct FrameClassifier {
    function: CodeAddress,
    convention: CallingConvention,
    frame: StackFrame,
    warnings: usize,
}

impl FrameClassifier {
    pub fn new(function: CodeAddress, convention: CallingConvention, frame: StackFrame) -> Self {
        Self {
            function,
            convention,
            frame,
            warnings: 0,
        }
    }

    /// Recognizes `PUSH BP; MOV BP,SP` (followed by `SUB SP,n` or a run of
    /// `DEC SP`) or `ENTER n,0` at the instruction starting at `entry`.
    pub fn detect(entry: u16, instructions: &[Instruction]) -> StackFrame {
        let mut frame = StackFrame::default();
        let Some(start) = instructions.iter().position(|i| i.offset() == entry) else {
            return frame;
        };
        let body = &instructions[start..];

        if let Some(enter) = body.first().filter(|i| i.mnemonic == Mnemonic::Enter) {
            let level = enter.op(1).and_then(Operand::as_immediate).unwrap_or(0);
            if level == 0 {
                frame.has_frame = true;
                frame.local_size = enter.op(0).and_then(Operand::as_immediate).unwrap_or(0) as u16;
            }
            return frame;
        }

        let opens = matches!(body, [push, mov, ..]
            if is_reg_op(push, Mnemonic::Push, Register::BP)
                && is_move(mov, Register::BP, Register::SP));
        if !opens {
            return frame;
        }
        frame.has_frame = true;

        let rest = &body[2..];
        if let Some(sub) = rest.first().filter(|i| i.mnemonic == Mnemonic::Sub) {
            if sub.op(0).and_then(Operand::as_register) == Some(Register::SP) {
                frame.local_size = sub.op(1).and_then(Operand::as_immediate).unwrap_or(0) as u16;
            }
        } else {
            frame.local_size = rest
                .iter()
                .take_while(|i| is_reg_op(i, Mnemonic::Dec, Register::SP))
                .count() as u16;
        }
        frame
    }

    /// Classifies every frame access in `instructions`, tagging the operands.
    pub fn classify(&mut self, instructions: &mut [Instruction]) {
        if !self.frame.has_frame {
            return;
        }
        for inst in instructions.iter_mut() {
            let at = inst.offset();
            for op in &mut inst.operands {
                let Operand::Memory(mem) = op else {
                    continue;
                };
                if !mem.is_frame_access() {
                    continue;
                }
                let indexed = mem.index_register().is_some();
                if let Some(kind) = self.record(mem.displacement, mem.size, indexed, at) {
                    mem.variable = Some(VariableRef {
                        kind,
                        displacement: mem.displacement,
                    });
                }
            }
        }
    }

    /// The classified frame and the number of unclassifiable accesses.
    pub fn finish(self) -> (StackFrame, usize) {
        (self.frame, self.warnings)
    }

    fn record(&mut self, displacement: i16, size: u8, indexed: bool, at: u16) -> Option<VariableKind> {
        let local_size = self.frame.local_size;
        let slot = if displacement >= FIRST_PARAMETER {
            let position = displacement - self.convention.parameter_base();
            Some((VariableKind::Parameter, position as u16))
        } else if displacement <= LAST_LOCAL {
            (u32::from(local_size) + 2)
                .checked_sub(u32::from(displacement.unsigned_abs()))
                .filter(|&offset| offset < u32::from(local_size))
                .map(|offset| (VariableKind::Local, offset as u16))
        } else {
            None
        };
        let Some((kind, offset)) = slot else {
            warn!(
                function = %self.function,
                at = format_args!("{:04X}", at),
                displacement,
                local_size,
                "frame access outside parameters and locals"
            );
            self.warnings += 1;
            return None;
        };

        let table = match kind {
            VariableKind::Parameter => &mut self.frame.parameters,
            VariableKind::Local => &mut self.frame.locals,
        };
        let variable = table
            .entry(displacement)
            .or_insert_with(|| Variable::new(kind, displacement, offset, size));
        variable.size = variable.size.max(size);
        variable.is_array |= indexed;
        Some(kind)
    }
}

fn is_reg_op(inst: &Instruction, mnemonic: Mnemonic, reg: Register) -> bool {
    inst.mnemonic == mnemonic && inst.op(0).and_then(Operand::as_register) == Some(reg)
}

fn is_move(inst: &Instruction, dst: Register, src: Register) -> bool {
    is_reg_op(inst, Mnemonic::Mov, dst) && inst.op(1).and_then(Operand::as_register) == Some(src)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{CallDistance, MemoryRef, RmBase, SegOff, SegmentId};

    fn function() -> CodeAddress {
        CodeAddress::new(SegmentId::resident(0), 0)
    }

    fn far() -> CallingConvention {
        CallingConvention {
            distance: Some(CallDistance::Far),
            ..CallingConvention::default()
        }
    }

    fn near() -> CallingConvention {
        CallingConvention {
            distance: Some(CallDistance::Near),
            ..CallingConvention::default()
        }
    }

    fn framed(local_size: u16) -> StackFrame {
        StackFrame {
            has_frame: true,
            local_size,
            ..StackFrame::default()
        }
    }

    fn load(base: RmBase, displacement: i16) -> Instruction {
        Instruction::new(SegOff::new(0, 0), 3, Mnemonic::Mov).with_operands(vec![
            Operand::reg(Register::AX),
            Operand::Memory(MemoryRef::based(base, displacement, 2)),
        ])
    }

    #[test]
    fn test_local_offset() {
        let mut classifier = FrameClassifier::new(function(), far(), framed(8));
        let mut body = vec![load(RmBase::Bp, -4)];
        classifier.classify(&mut body);
        let (frame, warnings) = classifier.finish();
        assert_eq!(warnings, 0);
        assert_eq!(frame.locals[&-4].offset, 6);
        let var = body[0].op(1).and_then(Operand::as_memory).unwrap().variable;
        assert_eq!(
            var,
            Some(VariableRef {
                kind: VariableKind::Local,
                displacement: -4
            })
        );
    }

    #[test]
    fn test_first_far_parameter() {
        let mut classifier = FrameClassifier::new(function(), far(), framed(0));
        classifier.classify(&mut [load(RmBase::Bp, 6), load(RmBase::Bp, 8)]);
        let (frame, _) = classifier.finish();
        assert_eq!(frame.parameters[&6].offset, 0);
        assert_eq!(frame.parameters[&8].offset, 2);
    }

    #[test]
    fn test_near_parameters_start_above_save_area() {
        let mut classifier = FrameClassifier::new(function(), near(), framed(0));
        let mut body = vec![load(RmBase::Bp, 4), load(RmBase::Bp, 6)];
        classifier.classify(&mut body);
        let (frame, warnings) = classifier.finish();
        assert_eq!(warnings, 1);
        assert!(!frame.parameters.contains_key(&4));
        assert_eq!(frame.parameters[&6].offset, 2);
        assert!(body[0].op(1).and_then(Operand::as_memory).unwrap().variable.is_none());
    }

    #[test]
    fn test_unknown_distance_parameter() {
        let mut classifier =
            FrameClassifier::new(function(), CallingConvention::default(), framed(0));
        classifier.classify(&mut [load(RmBase::Bp, 6)]);
        let (frame, warnings) = classifier.finish();
        assert_eq!(warnings, 0);
        assert_eq!(frame.parameters[&6].offset, 0);
    }

    #[test]
    fn test_local_range_ends() {
        let mut classifier = FrameClassifier::new(function(), far(), framed(8));
        let mut body = vec![
            load(RmBase::Bp, -10),
            load(RmBase::Bp, -9),
            load(RmBase::Bp, -3),
            load(RmBase::Bp, -2),
            load(RmBase::Bp, -11),
        ];
        classifier.classify(&mut body);
        let (frame, warnings) = classifier.finish();
        assert_eq!(frame.locals[&-10].offset, 0);
        assert_eq!(frame.locals[&-9].offset, 1);
        assert_eq!(frame.locals[&-3].offset, 7);
        assert!(!frame.locals.contains_key(&-2));
        assert!(!frame.locals.contains_key(&-11));
        assert_eq!(warnings, 2);
    }

    #[test]
    fn test_save_area_is_rejected() {
        let mut classifier = FrameClassifier::new(function(), far(), framed(4));
        let mut body = vec![load(RmBase::Bp, 2), load(RmBase::Bp, -7)];
        classifier.classify(&mut body);
        let (frame, warnings) = classifier.finish();
        assert_eq!(warnings, 2);
        assert!(frame.parameters.is_empty() && frame.locals.is_empty());
    }

    #[test]
    fn test_indexed_access_marks_array() {
        let mut classifier = FrameClassifier::new(function(), far(), framed(0x10));
        classifier.classify(&mut [load(RmBase::Bp, -0x10), load(RmBase::BpSi, -0x10)]);
        let (frame, _) = classifier.finish();
        assert_eq!(frame.locals.len(), 1);
        assert!(frame.locals[&-0x10].is_array);
    }

    #[test]
    fn test_detect_sub_sp() {
        let body = vec![
            Instruction::new(SegOff::new(0, 0), 1, Mnemonic::Push).with_operand(Operand::reg(Register::BP)),
            Instruction::new(SegOff::new(0, 1), 2, Mnemonic::Mov)
                .with_operands(vec![Operand::reg(Register::BP), Operand::reg(Register::SP)]),
            Instruction::new(SegOff::new(0, 3), 3, Mnemonic::Sub)
                .with_operands(vec![Operand::reg(Register::SP), Operand::imm(8, 16)]),
        ];
        let frame = FrameClassifier::detect(0, &body);
        assert!(frame.has_frame);
        assert_eq!(frame.local_size, 8);
    }

    #[test]
    fn test_detect_enter() {
        let body = vec![Instruction::new(SegOff::new(0, 0), 4, Mnemonic::Enter)
            .with_operands(vec![Operand::imm(6, 16), Operand::imm(0, 8)])];
        let frame = FrameClassifier::detect(0, &body);
        assert!(frame.has_frame);
        assert_eq!(frame.local_size, 6);
    }
}
