//! Worklist disassembly of one function body.
//!
//! Decoding runs sequentially from the current address. Direct jumps
//! continue inline at their target, conditional branches push the target
//! and continue with the fall-through, and indirect jumps are parked as
//! possible switch sites. Once the branch worklist drains, parked sites are
//! matched against the known dispatch shapes; a recovered table pushes its
//! targets and decoding resumes.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace, warn};

use dosrec_core::{
    CallModel, CodeAddress, ControlFlow, Instruction, LinkFixup, Mnemonic, Operand, Register,
    RelocationKind, SegOff, Segment,
};
use dosrec_disasm::{Decoder16, Disassembler};

use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, Result};
use crate::switch_recovery::{self, SwitchTable};

/// Everything the engine learned about one body.
#[derive(Debug, Clone, Default)]
pub struct EngineOutput {
    /// Instructions sorted by address, ending with a return-class
    /// instruction (synthesized when the body fell off its end).
    pub instructions: Vec<Instruction>,
    /// Undefined opcodes that ended a path.
    pub unknown_opcodes: usize,
    /// Indirect jumps no switch shape matched.
    pub unresolved_switches: Vec<u16>,
    /// Recovered jump tables.
    pub switches: Vec<SwitchTable>,
    pub synthesized_return: bool,
}

#[derive(Default)]
struct State {
    decoded: BTreeMap<u16, Instruction>,
    branches: Vec<u16>,
    switch_sites: Vec<u16>,
    /// Offsets folded into a SWITCH.
    covered: BTreeSet<u16>,
    /// Sequential instructions that end the program.
    exits: BTreeSet<u16>,
    unknown_opcodes: usize,
    unresolved_switches: Vec<u16>,
    switches: Vec<SwitchTable>,
}

/// Disassembles function bodies inside one segment.
pub struct DisassemblyEngine<'a> {
    segment: &'a Segment,
    config: &'a AnalysisConfig,
    decoder: Decoder16,
}

impl<'a> DisassemblyEngine<'a> {
    pub fn new(segment: &'a Segment, config: &'a AnalysisConfig) -> Self {
        Self {
            segment,
            config,
            decoder: Decoder16::with_options(config.decoder),
        }
    }

    /// Disassembles the body reachable from `entry`.
    pub fn disassemble(&self, entry: u16) -> Result<EngineOutput> {
        let mut state = State::default();
        state.branches.push(entry);

        loop {
            while let Some(start) = state.branches.pop() {
                self.trace_path(start, &mut state)?;
            }
            let Some(site) = state.switch_sites.pop() else {
                break;
            };
            self.resolve_switch(site, &mut state);
        }

        let mut instructions: Vec<Instruction> = state.decoded.into_values().collect();
        let synthesized_return = match instructions.last() {
            None => true,
            Some(last) => last.falls_through() && !state.exits.contains(&last.offset()),
        };
        if synthesized_return {
            let at = instructions.last().map_or(entry, Instruction::end_offset);
            warn!(
                segment = %self.segment.id,
                entry = format_args!("{:04X}", entry),
                at = format_args!("{:04X}", at),
                "body has no terminating return, synthesizing one"
            );
            instructions.push(self.synthesized_return(at));
        }
        mark_labels(&mut instructions);

        Ok(EngineOutput {
            instructions,
            unknown_opcodes: state.unknown_opcodes,
            unresolved_switches: state.unresolved_switches,
            switches: state.switches,
            synthesized_return,
        })
    }

    fn trace_path(&self, start: u16, state: &mut State) -> Result<()> {
        let mut pc = start;
        loop {
            if state.decoded.contains_key(&pc) || state.covered.contains(&pc) {
                return Ok(());
            }
            if !self.segment.contains(pc) {
                debug!(offset = format_args!("{:04X}", pc), "path ran off the segment");
                return Ok(());
            }

            let inst = match self.decode_at(pc) {
                Ok(inst) => inst,
                Err(err) if err.is_truncated() => return Err(err.into()),
                Err(err) => {
                    debug!(%err, "undefined opcode ends path");
                    state.unknown_opcodes += 1;
                    return Ok(());
                }
            };
            trace!(offset = format_args!("{:04X}", pc), %inst, "decoded");

            let next = inst.end_offset();
            let flow = inst.control_flow();
            let exits = is_dos_exit(&inst, previous(state, pc));
            if exits {
                state.exits.insert(pc);
            }
            if let ControlFlow::Jump { target } | ControlFlow::ConditionalBranch { target, .. } =
                flow
            {
                self.check_target(&inst, target)?;
            }
            state.decoded.insert(pc, inst);

            match flow {
                ControlFlow::Sequential
                | ControlFlow::Call { .. }
                | ControlFlow::IndirectCall { .. } => {
                    if exits {
                        return Ok(());
                    }
                    pc = next;
                }
                ControlFlow::Jump { target } => pc = target,
                ControlFlow::ConditionalBranch {
                    target,
                    fallthrough,
                } => {
                    state.branches.push(target);
                    pc = fallthrough;
                }
                ControlFlow::IndirectJump => {
                    state.switch_sites.push(pc);
                    return Ok(());
                }
                ControlFlow::Switch { .. }
                | ControlFlow::FarJump { .. }
                | ControlFlow::Return
                | ControlFlow::Exit
                | ControlFlow::Halt => return Ok(()),
            }
        }
    }

    fn decode_at(&self, pc: u16) -> std::result::Result<Instruction, dosrec_disasm::DecodeError> {
        let address = SegOff::new(self.segment.id.segment, pc);
        let decoded = self
            .decoder
            .decode_instruction(self.segment.tail(pc), address)?;
        let mut inst = decoded.instruction;
        self.mark_relocations(&mut inst);
        Ok(inst)
    }

    /// Flags immediates and far pointers whose trailing word is patched at
    /// load or link time.
    fn mark_relocations(&self, inst: &mut Instruction) {
        if inst.size < 3 {
            return;
        }
        let word = inst.end_offset().wrapping_sub(2);
        let segment_fixup = self.segment.has_segment_fixup(word);
        let offset_fixup = self
            .segment
            .relocation_at(word)
            .is_some_and(|r| r.kind == RelocationKind::Offset);
        if !segment_fixup && !offset_fixup {
            return;
        }
        for op in &mut inst.operands {
            match op {
                Operand::Immediate(imm) if imm.size == 16 => {
                    imm.fixup = Some(if segment_fixup {
                        LinkFixup::Segment
                    } else {
                        LinkFixup::Offset
                    });
                }
                Operand::FarPointer(ptr) if segment_fixup => ptr.relocated = true,
                _ => {}
            }
        }
    }

    fn check_target(&self, inst: &Instruction, target: u16) -> Result<()> {
        if self.segment.contains(target) {
            return Ok(());
        }
        Err(AnalysisError::TargetOutOfBounds {
            site: CodeAddress::new(self.segment.id, inst.offset()),
            target: format!("{}:{:04X}", self.segment.id, target),
        })
    }

    fn resolve_switch(&self, site: u16, state: &mut State) {
        let window = self.window_before(site, state);
        match switch_recovery::recognize(&window, self.segment) {
            Some(table) => {
                for offset in &table.covered {
                    state.decoded.remove(offset);
                    state.covered.insert(*offset);
                }
                let switch = table.to_instruction();
                state.decoded.insert(switch.offset(), switch);
                let mut targets: Vec<u16> = table.targets().collect();
                targets.reverse();
                state.branches.extend(targets);
                state.switches.push(table);
            }
            None => {
                warn!(
                    segment = %self.segment.id,
                    site = format_args!("{:04X}", site),
                    "indirect jump matches no switch shape, path left unexplored"
                );
                state.unresolved_switches.push(site);
            }
        }
    }

    /// Up to `switch_window` address-contiguous instructions ending at `site`.
    fn window_before(&self, site: u16, state: &State) -> Vec<Instruction> {
        let mut window = Vec::with_capacity(self.config.switch_window);
        let Some(last) = state.decoded.get(&site) else {
            return window;
        };
        window.push(last.clone());
        let mut at = site;
        while window.len() < self.config.switch_window {
            match state.decoded.range(..at).next_back() {
                Some((_, prev)) if prev.end_offset() == at && !prev.synthetic => {
                    at = prev.offset();
                    window.push(prev.clone());
                }
                _ => break,
            }
        }
        window.reverse();
        window
    }

    fn synthesized_return(&self, at: u16) -> Instruction {
        let mnemonic = match self.segment.model {
            CallModel::Far => Mnemonic::Retf,
            CallModel::Near | CallModel::Mixed => Mnemonic::Ret,
        };
        let mut inst = Instruction::new(SegOff::new(self.segment.id.segment, at), 0, mnemonic);
        inst.synthetic = true;
        inst
    }
}

/// The decoded instruction ending exactly at `pc`.
fn previous(state: &State, pc: u16) -> Option<&Instruction> {
    state
        .decoded
        .range(..pc)
        .next_back()
        .map(|(_, inst)| inst)
        .filter(|inst| inst.end_offset() == pc)
}

/// `INT 21h` with function 4Ch loaded into AH just before.
fn is_dos_exit(inst: &Instruction, previous: Option<&Instruction>) -> bool {
    if inst.mnemonic != Mnemonic::Int || inst.op(0).and_then(Operand::as_immediate) != Some(0x21) {
        return false;
    }
    let Some(prev) = previous else {
        return false;
    };
    if prev.mnemonic != Mnemonic::Mov {
        return false;
    }
    let value = prev.op(1).and_then(Operand::as_immediate);
    match (prev.op(0).and_then(Operand::as_register), value) {
        (Some(Register::AH), Some(v)) => v == 0x4C,
        (Some(Register::AX), Some(v)) => (v >> 8) & 0xFF == 0x4C,
        _ => false,
    }
}

/// Sets the label flag on every instruction some branch targets.
pub(crate) fn mark_labels(instructions: &mut [Instruction]) {
    let targets: BTreeSet<u16> = instructions
        .iter()
        .flat_map(Instruction::branch_targets)
        .collect();
    for inst in instructions.iter_mut() {
        inst.is_label = targets.contains(&inst.offset());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{Relocation, SegmentId};

    fn run(bytes: &[u8]) -> Result<EngineOutput> {
        let segment = Segment::new(SegmentId::resident(0x100), bytes.to_vec());
        DisassemblyEngine::new(&segment, &AnalysisConfig::default()).disassemble(0)
    }

    fn offsets(output: &EngineOutput) -> Vec<u16> {
        output.instructions.iter().map(Instruction::offset).collect()
    }

    #[test]
    fn test_conditional_branch_and_synthesized_return() {
        // je 4 ; inc ax ; ret ; dec ax <end>
        let output = run(&[0x74, 0x02, 0x40, 0xC3, 0x48]).unwrap();
        assert_eq!(offsets(&output), vec![0, 2, 3, 4, 5]);
        assert!(output.synthesized_return);
        let last = output.instructions.last().unwrap();
        assert_eq!(last.mnemonic, Mnemonic::Ret);
        assert!(last.synthetic);
        assert!(output.instructions[3].is_label);
        assert!(!output.instructions[1].is_label);
    }

    #[test]
    fn test_jump_skips_data() {
        // jmp 4 ; <data> ; ret
        let output = run(&[0xEB, 0x02, 0xD6, 0xD6, 0xC3]).unwrap();
        assert_eq!(offsets(&output), vec![0, 4]);
        assert!(!output.synthesized_return);
        assert_eq!(output.unknown_opcodes, 0);
    }

    #[test]
    fn test_unknown_opcode_ends_path() {
        let output = run(&[0x40, 0xD6, 0xC3]).unwrap();
        assert_eq!(output.unknown_opcodes, 1);
        assert!(output.synthesized_return);
    }

    #[test]
    fn test_jump_outside_segment_is_fatal() {
        let err = run(&[0xE9, 0x00, 0x10]).unwrap_err();
        assert!(matches!(err, AnalysisError::TargetOutOfBounds { .. }));
    }

    #[test]
    fn test_truncated_instruction_is_fatal() {
        let err = run(&[0x40, 0xB8, 0x01]).unwrap_err();
        assert!(matches!(err, AnalysisError::Decode(_)));
    }

    #[test]
    fn test_dos_exit_needs_no_return() {
        // mov ah, 4Ch ; int 21h
        let output = run(&[0xB4, 0x4C, 0xCD, 0x21]).unwrap();
        assert_eq!(offsets(&output), vec![0, 2]);
        assert!(!output.synthesized_return);
    }

    #[test]
    fn test_other_dos_call_falls_through() {
        // mov ah, 09h ; int 21h ; ret
        let output = run(&[0xB4, 0x09, 0xCD, 0x21, 0xC3]).unwrap();
        assert_eq!(offsets(&output), vec![0, 2, 4]);
    }

    #[test]
    fn test_switch_targets_are_followed() {
        #[rustfmt::skip]
        let image = [
            0x83, 0xF8, 0x03,
            0x77, 0x17,
            0x8B, 0xD8,
            0xD1, 0xE3,
            0x2E, 0xFF, 0xA7, 0x10, 0x00,
            0x90, 0x90,
            0x18, 0x00, 0x19, 0x00, 0x1A, 0x00, 0x1B, 0x00,
            0xC3, 0xC3, 0xC3, 0xC3, 0xC3,
        ];
        let output = run(&image).unwrap();
        assert_eq!(output.switches.len(), 1);
        assert!(output.unresolved_switches.is_empty());
        assert_eq!(offsets(&output), vec![0, 0x18, 0x19, 0x1A, 0x1B, 0x1C]);
        assert_eq!(output.instructions[0].mnemonic, Mnemonic::Switch);
        assert!(output.instructions[1..].iter().all(|i| i.is_label));
    }

    #[test]
    fn test_unresolved_indirect_jump() {
        // jmp [bx]
        let output = run(&[0xFF, 0x27]).unwrap();
        assert_eq!(output.unresolved_switches, vec![0]);
        assert!(!output.synthesized_return);
    }

    #[test]
    fn test_segment_relocation_marks_immediate() {
        // mov ax, seg ; mov ds, ax ; ret
        let mut segment = Segment::new(SegmentId::resident(0), vec![0xB8, 0x34, 0x12, 0x8E, 0xD8, 0xC3]);
        segment.add_relocation(Relocation {
            offset: 1,
            kind: RelocationKind::Segment,
            target_segment: None,
        });
        let config = AnalysisConfig::default();
        let output = DisassemblyEngine::new(&segment, &config).disassemble(0).unwrap();
        match output.instructions[0].op(1) {
            Some(Operand::Immediate(imm)) => assert_eq!(imm.fixup, Some(LinkFixup::Segment)),
            other => panic!("unexpected operand {:?}", other),
        }
    }
}
