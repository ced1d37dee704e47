//! Call-graph discovery.
//!
//! Functions are created on first reference and built breadth-first from a
//! queue. Building a function runs the engine, infers its convention and
//! frame, normalizes the body, and resolves every direct transfer leaving
//! it. Library routines are bound by name and never disassembled.

use std::collections::VecDeque;

use tracing::{debug, info};

use dosrec_core::{
    AddressingMode, CallTarget, CodeAddress, ControlFlow, DisplacementSize, FunctionId,
    FunctionKind, FunctionState, Instruction, Mnemonic, Operand, Register, SegOff, Segment,
    SegmentBase, SegmentId,
};
use dosrec_disasm::{Decoder16, Disassembler};
use dosrec_signatures::{LibraryMatcher, MatchSet, ObjectLibrary};

use crate::callgraph::{CallGraph, CallKind, CallSite};
use crate::config::AnalysisConfig;
use crate::convention::{check_frame_teardown, infer_convention};
use crate::engine::DisassemblyEngine;
use crate::error::{AnalysisError, Result};
use crate::normalize::Normalizer;
use crate::program::Program;
use crate::stack_frame::FrameClassifier;

/// A global data access found in a body.
struct GlobalAccess {
    segment: SegmentId,
    offset: u16,
    size: u8,
    indexed: bool,
}

/// Drives function discovery over a [`Program`].
pub struct Resolver<'p> {
    program: &'p mut Program,
    config: &'p AnalysisConfig,
    library: Option<(&'p ObjectLibrary, MatchSet)>,
    queue: VecDeque<FunctionId>,
    graph: CallGraph,
}

impl<'p> Resolver<'p> {
    pub fn new(program: &'p mut Program, config: &'p AnalysisConfig) -> Self {
        Self {
            program,
            config,
            library: None,
            queue: VecDeque::new(),
            graph: CallGraph::new(),
        }
    }

    /// Scans every segment for `library` modules. Routines starting inside
    /// a match are bound to the module instead of being disassembled.
    pub fn with_library(mut self, library: &'p ObjectLibrary) -> Self {
        let matches = LibraryMatcher::new(library)
            .with_min_length(self.config.min_library_length)
            .scan_all(self.program.segments());
        info!(
            library = %library.name,
            matches = matches.len(),
            "library modules matched"
        );
        self.library = Some((library, matches));
        self
    }

    /// Library matches found by [`Resolver::with_library`].
    pub fn library_matches(&self) -> Option<&MatchSet> {
        self.library.as_ref().map(|(_, matches)| matches)
    }

    /// Registers a program entry point.
    pub fn add_entry_point(&mut self, segment: SegmentId, offset: u16) -> Result<FunctionId> {
        self.resolve(segment, offset)
    }

    /// Returns the function at `segment:offset`, creating and queueing it on
    /// first reference. Repeated calls return the same id.
    pub fn resolve(&mut self, segment: SegmentId, offset: u16) -> Result<FunctionId> {
        self.resolve_from(CodeAddress::new(segment, offset), segment, offset)
    }

    /// Builds queued functions until none remain.
    pub fn run(&mut self) -> Result<()> {
        while let Some(id) = self.queue.pop_front() {
            self.build(id)?;
        }
        info!(
            functions = self.program.function_count(),
            edges = self.graph.edge_count(),
            unresolved = self.graph.unresolved_calls().len(),
            "call graph resolved"
        );
        Ok(())
    }

    pub fn call_graph(&self) -> &CallGraph {
        &self.graph
    }

    pub fn into_call_graph(self) -> CallGraph {
        self.graph
    }

    fn resolve_from(&mut self, site: CodeAddress, segment: SegmentId, offset: u16) -> Result<FunctionId> {
        let mut stubs = Vec::new();
        let mut at = offset;
        let id = loop {
            if let Some(id) = self.program.lookup(segment, at) {
                break id;
            }
            if !self.program.require_segment(segment)?.contains(at) {
                return Err(AnalysisError::TargetOutOfBounds {
                    site,
                    target: CodeAddress::new(segment, at).to_string(),
                });
            }
            if let Some(id) = self.bind_library(segment, at)? {
                break id;
            }
            if self.config.thunk_segment == Some(segment) {
                let seg = self.program.require_segment(segment)?;
                if let Some(next) = self.thunk_target(seg, at)? {
                    if next != at && !stubs.contains(&next) {
                        stubs.push(at);
                        self.program.stats.thunks_followed += 1;
                        debug!(
                            stub = %CodeAddress::new(segment, at),
                            target = format_args!("{:04X}", next),
                            "following thunk"
                        );
                        at = next;
                        continue;
                    }
                }
            }
            let id = self.program.create_function(segment, at)?;
            self.queue.push_back(id);
            break id;
        };
        for stub in stubs {
            self.program.add_alias(segment, stub, id)?;
        }
        Ok(id)
    }

    /// Binds a library routine starting at `segment:offset`, if one matched.
    fn bind_library(&mut self, segment: SegmentId, offset: u16) -> Result<Option<FunctionId>> {
        let Some((library, matches)) = &self.library else {
            return Ok(None);
        };
        let Some(found) = matches.find(segment, offset) else {
            return Ok(None);
        };
        let name = found.symbol_at(library, offset);
        let module = found.module.clone();

        let id = self.program.create_function(segment, offset)?;
        if let Some(function) = self.program.function_mut(id) {
            debug!(
                address = %CodeAddress::new(segment, offset),
                name = %name,
                module = %module,
                "bound library routine"
            );
            function.name = Some(name);
            function.kind = FunctionKind::Library { module };
            function.state = FunctionState::Built;
        }
        self.program.stats.library_functions += 1;
        Ok(Some(id))
    }

    /// The target of a stub made of a single direct near jump.
    fn thunk_target(&self, segment: &Segment, offset: u16) -> Result<Option<u16>> {
        let decoder = Decoder16::with_options(self.config.decoder);
        let Ok(decoded) =
            decoder.decode_instruction(segment.tail(offset), SegOff::new(segment.id.segment, offset))
        else {
            return Ok(None);
        };
        let inst = decoded.instruction;
        if inst.mnemonic != Mnemonic::Jmp {
            return Ok(None);
        }
        let Some(Operand::Relative { target, .. }) = inst.op(0) else {
            return Ok(None);
        };
        if !segment.contains(*target) {
            return Err(AnalysisError::TargetOutOfBounds {
                site: CodeAddress::new(segment.id, offset),
                target: CodeAddress::new(segment.id, *target).to_string(),
            });
        }
        Ok(Some(*target))
    }

    fn build(&mut self, id: FunctionId) -> Result<()> {
        let Some(function) = self.program.function(id) else {
            return Ok(());
        };
        if function.state == FunctionState::Built {
            return Ok(());
        }
        let segment_id = function.segment;
        let entry = function.entry;
        let address = CodeAddress::new(segment_id, entry);
        debug!(function = %address, "building");

        let segment = self.program.require_segment(segment_id)?;
        let engine = DisassemblyEngine::new(segment, self.config).disassemble(entry)?;
        let convention = infer_convention(address, &engine.instructions, segment.model)?;
        let frame = FrameClassifier::detect(entry, &engine.instructions);
        if frame.has_frame && self.config.strict_frames {
            check_frame_teardown(address, &engine.instructions)?;
        }

        let data = self
            .config
            .data_segment
            .and_then(|data| self.program.segment(data));
        let normalized = Normalizer::new(self.config, segment)
            .with_data_segment(data)
            .run(engine.instructions);

        let mut instructions = normalized.instructions;
        let mut classifier = FrameClassifier::new(address, convention, frame);
        classifier.classify(&mut instructions);
        let (frame, frame_warnings) = classifier.finish();

        let globals = self.global_accesses(segment_id, &instructions);

        let stats = &mut self.program.stats;
        stats.functions_built += 1;
        stats.unknown_opcodes += engine.unknown_opcodes;
        stats.unresolved_switches += engine.unresolved_switches.len();
        stats.switches += engine.switches.len();
        stats.synthesized_returns += usize::from(engine.synthesized_return);
        stats.hooks_removed += normalized.hooks_removed;
        stats.frame_warnings += frame_warnings;

        if let Some(name) = normalized.source_names.into_iter().next() {
            self.program.set_source_name(id, name);
        }
        for access in globals {
            if let Some(owner) = self.program.segment_mut(access.segment) {
                owner.record_global(access.offset, access.size, access.indexed);
            }
        }

        self.resolve_callees(id, segment_id, &instructions)?;

        if let Some(function) = self.program.function_mut(id) {
            function.instructions = instructions;
            function.convention = convention;
            function.frame = frame;
            function.state = FunctionState::Built;
        }
        Ok(())
    }

    /// Direct-address data operands and the segment each one lands in.
    fn global_accesses(&self, code: SegmentId, instructions: &[Instruction]) -> Vec<GlobalAccess> {
        let mut accesses = Vec::new();
        for inst in instructions {
            for mem in inst.operands.iter().filter_map(Operand::as_memory) {
                if mem.variable.is_some() || mem.is_frame_access() {
                    continue;
                }
                let indexed = match mem.mode {
                    AddressingMode::Direct => false,
                    // a word displacement off a non-BP base is a global array base
                    AddressingMode::Based {
                        base,
                        displacement: DisplacementSize::Word,
                    } if !base.uses_bp() => true,
                    AddressingMode::Based { .. } => continue,
                };
                let owner = match mem.segment {
                    SegmentBase::Register(Register::DS) => self.config.data_segment,
                    SegmentBase::Register(Register::CS) => Some(code),
                    SegmentBase::Register(_) => None,
                    SegmentBase::Immediate { value, .. } => Some(SegmentId::resident(value))
                        .filter(|id| self.program.segment(*id).is_some()),
                };
                let Some(segment) = owner else {
                    continue;
                };
                accesses.push(GlobalAccess {
                    segment,
                    offset: mem.displacement as u16,
                    size: mem.size,
                    indexed,
                });
            }
        }
        accesses
    }

    fn resolve_callees(
        &mut self,
        caller: FunctionId,
        segment: SegmentId,
        instructions: &[Instruction],
    ) -> Result<()> {
        for inst in instructions {
            let site = CodeAddress::new(segment, inst.offset());
            let (target, kind) = match inst.control_flow() {
                ControlFlow::Call { target, .. } => match target {
                    CallTarget::Near(offset) => (CodeAddress::new(segment, offset), CallKind::Near),
                    CallTarget::Far(address) => (self.far_target(site, address)?, CallKind::Far),
                    CallTarget::Overlay { overlay, offset } => {
                        let Some(overlay_segment) = self.program.overlay_segment(overlay) else {
                            return Err(AnalysisError::TargetOutOfBounds {
                                site,
                                target: format!("overlay {}:{:04X}", overlay, offset),
                            });
                        };
                        (CodeAddress::new(overlay_segment, offset), CallKind::Overlay)
                    }
                },
                ControlFlow::FarJump { target } => (self.far_target(site, target)?, CallKind::Jump),
                ControlFlow::IndirectCall { .. } => {
                    self.graph.add_unresolved_call(caller, inst.offset());
                    continue;
                }
                _ => continue,
            };

            if self.config.hook_at(target.seg_off()).is_some() {
                continue;
            }
            let callee = self.resolve_from(site, target.segment, target.offset)?;
            debug!(
                site = %site,
                callee = %target,
                kind = ?kind,
                "call resolved"
            );
            self.graph.add_call(
                callee,
                CallSite {
                    caller,
                    offset: inst.offset(),
                    kind,
                },
            );
        }
        Ok(())
    }

    /// Maps a far `segment:offset` to a known segment. A paragraph equal to
    /// the caller's stays in the caller's segment, overlays included.
    fn far_target(&self, site: CodeAddress, address: SegOff) -> Result<CodeAddress> {
        if address.segment == site.segment.segment {
            return Ok(CodeAddress::new(site.segment, address.offset));
        }
        self.program
            .locate(address)
            .ok_or_else(|| AnalysisError::TargetOutOfBounds {
                site,
                target: address.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::VariableKind;
    use dosrec_signatures::{ModuleSegment, ObjectModule};

    const CODE: SegmentId = SegmentId::resident(0x0100);

    fn program(code: Vec<u8>) -> Program {
        let mut program = Program::new();
        program.add_segment(Segment::new(CODE, code));
        program
    }

    #[test]
    fn test_memoized_resolution() {
        // call 7; call 7; ret; ret
        let mut program = program(vec![0xE8, 0x04, 0x00, 0xE8, 0x01, 0x00, 0xC3, 0xC3]);
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config);
        let main = resolver.add_entry_point(CODE, 0).unwrap();
        resolver.run().unwrap();

        let callee = resolver.resolve(CODE, 7).unwrap();
        assert_ne!(main, callee);
        assert_eq!(resolver.call_graph().edge_count(), 2);
        assert_eq!(resolver.call_graph().callers(callee).count(), 2);
        drop(resolver);

        assert_eq!(program.function_count(), 2);
        assert_eq!(program.stats.functions_built, 2);
        assert!(program
            .functions()
            .all(|f| f.state == FunctionState::Built));
    }

    #[test]
    fn test_library_routine_is_not_disassembled() {
        // call 4; ret; push bp; mov bp,sp; pop bp; ret
        let mut program = program(vec![0xE8, 0x01, 0x00, 0xC3, 0x55, 0x8B, 0xEC, 0x5D, 0xC3]);
        let mut library = ObjectLibrary::new("clib");
        library.add(
            ObjectModule::new("strlen").with_segment(
                ModuleSegment::new("_TEXT", "CODE", vec![0x55, 0x8B, 0xEC, 0x5D, 0xC3])
                    .with_public("_strlen", 0),
            ),
        );
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config).with_library(&library);
        resolver.add_entry_point(CODE, 0).unwrap();
        resolver.run().unwrap();
        drop(resolver);

        let id = program.lookup(CODE, 4).unwrap();
        let function = program.function(id).unwrap();
        assert_eq!(function.display_name(), "_strlen");
        assert!(function.is_library());
        assert!(function.instructions.is_empty());
        assert_eq!(program.stats.library_functions, 1);
        assert_eq!(program.stats.functions_built, 1);
    }

    #[test]
    fn test_thunk_is_followed() {
        let stubs = SegmentId::resident(0);
        let mut program = Program::new();
        // 0: jmp 3; 3: ret
        program.add_segment(Segment::new(stubs, vec![0xEB, 0x01, 0x90, 0xC3]));
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config);
        let id = resolver.add_entry_point(stubs, 0).unwrap();
        resolver.run().unwrap();
        drop(resolver);

        assert_eq!(program.function(id).unwrap().entry, 3);
        assert_eq!(program.lookup(stubs, 0), Some(id));
        assert_eq!(program.stats.thunks_followed, 1);
        assert_eq!(program.function_count(), 1);
    }

    #[test]
    fn test_self_jump_stub_is_a_function() {
        let stubs = SegmentId::resident(0);
        let mut program = Program::new();
        // 0: jmp 0
        program.add_segment(Segment::new(stubs, vec![0xEB, 0xFE]));
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config);
        let id = resolver.add_entry_point(stubs, 0).unwrap();
        resolver.run().unwrap();
        drop(resolver);

        assert_eq!(program.function(id).unwrap().entry, 0);
        assert_eq!(program.stats.thunks_followed, 0);
    }

    #[test]
    fn test_near_call_out_of_bounds() {
        // call 0x1000
        let mut program = program(vec![0xE8, 0xFD, 0x0F, 0xC3]);
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config);
        resolver.add_entry_point(CODE, 0).unwrap();
        assert!(matches!(
            resolver.run(),
            Err(AnalysisError::TargetOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_far_call_to_other_segment() {
        let other = SegmentId::resident(0x0200);
        // call far 0200:0001; retf
        let mut program = program(vec![0x9A, 0x01, 0x00, 0x00, 0x02, 0xCB]);
        program.add_segment(Segment::new(other, vec![0x90, 0xCB]));
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config);
        let main = resolver.add_entry_point(CODE, 0).unwrap();
        resolver.run().unwrap();

        let callees: Vec<_> = resolver.call_graph().callees(main).collect();
        assert_eq!(callees.len(), 1);
        assert_eq!(callees[0].1.kind, CallKind::Far);
        drop(resolver);

        let callee = program.lookup(other, 1).unwrap();
        assert_eq!(program.function(callee).unwrap().segment, other);
    }

    #[test]
    fn test_indirect_call_is_recorded_unresolved() {
        // call bx; ret
        let mut program = program(vec![0xFF, 0xD3, 0xC3]);
        let config = AnalysisConfig::default();
        let mut resolver = Resolver::new(&mut program, &config);
        let main = resolver.add_entry_point(CODE, 0).unwrap();
        resolver.run().unwrap();
        assert_eq!(resolver.call_graph().unresolved_calls(), &[(main, 0)]);
    }

    #[test]
    fn test_frame_and_globals_are_recorded() {
        let data = SegmentId::resident(0x0300);
        let code = vec![
            0x55, // push bp
            0x8B, 0xEC, // mov bp, sp
            0x83, 0xEC, 0x04, // sub sp, 4
            0x8B, 0x46, 0x06, // mov ax, [bp+6]
            0xA3, 0x10, 0x00, // mov [0010], ax
            0x8B, 0xE5, // mov sp, bp
            0x5D, // pop bp
            0xC3, // ret
        ];
        let mut program = program(code);
        program.add_segment(Segment::new(data, vec![0; 0x20]));
        let config = AnalysisConfig::default().with_data_segment(data);
        let mut resolver = Resolver::new(&mut program, &config);
        let main = resolver.add_entry_point(CODE, 0).unwrap();
        resolver.run().unwrap();
        drop(resolver);

        let function = program.function(main).unwrap();
        assert!(function.frame.has_frame);
        assert_eq!(function.frame.local_size, 4);
        let arg = function.frame.variable(VariableKind::Parameter, 6).unwrap();
        assert_eq!(arg.offset, 2);

        let global = program.segment(data).unwrap().globals.get(&0x10).unwrap();
        assert_eq!(global.size, 2);
        assert!(!global.is_array);
    }
}
