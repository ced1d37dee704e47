//! The program registry: segments, functions and run statistics.
//!
//! Functions live in an arena indexed by [`FunctionId`]; each segment maps
//! entry offsets to ids. Entries are only ever added.

use std::collections::BTreeMap;

use dosrec_core::{CodeAddress, Function, FunctionId, SegOff, Segment, SegmentId};

use crate::error::{AnalysisError, Result};

/// Counters collected during a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnalysisStats {
    /// Functions disassembled and normalized.
    pub functions_built: usize,
    /// Functions bound to a library module instead of being disassembled.
    pub library_functions: usize,
    /// Undefined opcodes that ended a path.
    pub unknown_opcodes: usize,
    /// Indirect jumps no switch shape matched.
    pub unresolved_switches: usize,
    /// Recovered switches.
    pub switches: usize,
    /// Bodies that needed a synthesized return.
    pub synthesized_returns: usize,
    /// Stubs followed to their jump target.
    pub thunks_followed: usize,
    /// Hook calls removed.
    pub hooks_removed: usize,
    /// Frame accesses left unclassified.
    pub frame_warnings: usize,
}

/// All segments of a program and the functions recovered from them.
#[derive(Debug, Default)]
pub struct Program {
    segments: BTreeMap<SegmentId, Segment>,
    functions: Vec<Function>,
    source_names: BTreeMap<FunctionId, String>,
    pub stats: AnalysisStats,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.insert(segment.id, segment);
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(&id)
    }

    pub fn segment_mut(&mut self, id: SegmentId) -> Option<&mut Segment> {
        self.segments.get_mut(&id)
    }

    /// Segments in (overlay, paragraph) order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Looks a segment up, failing with `UnknownSegment`.
    pub fn require_segment(&self, id: SegmentId) -> Result<&Segment> {
        self.segments
            .get(&id)
            .ok_or(AnalysisError::UnknownSegment(id))
    }

    /// Maps a resident `segment:offset` to the segment that holds it.
    ///
    /// The paragraph is tried as a segment identity first, then the linear
    /// address is searched for among resident segments.
    pub fn locate(&self, address: SegOff) -> Option<CodeAddress> {
        let direct = SegmentId::resident(address.segment);
        if let Some(segment) = self.segments.get(&direct) {
            if segment.contains(address.offset) {
                return Some(CodeAddress::new(direct, address.offset));
            }
        }
        let linear = address.linear();
        self.segments
            .values()
            .filter(|segment| !segment.id.is_overlay())
            .find(|segment| segment.contains_linear(linear))
            .and_then(|segment| {
                let offset = u16::try_from(linear - segment.linear_base()).ok()?;
                Some(CodeAddress::new(segment.id, offset))
            })
    }

    /// The first segment of an overlay.
    pub fn overlay_segment(&self, overlay: u16) -> Option<SegmentId> {
        self.segments
            .keys()
            .find(|id| id.overlay == overlay)
            .copied()
    }

    pub fn function(&self, id: FunctionId) -> Option<&Function> {
        self.functions.get(id.0 as usize)
    }

    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut Function> {
        self.functions.get_mut(id.0 as usize)
    }

    /// All functions in creation order.
    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// The function registered at `segment:offset`, including aliases
    /// recorded for followed thunks.
    pub fn lookup(&self, segment: SegmentId, offset: u16) -> Option<FunctionId> {
        self.segments.get(&segment)?.function_at(offset)
    }

    /// Creates an empty function and registers it at its entry.
    pub fn create_function(&mut self, segment: SegmentId, entry: u16) -> Result<FunctionId> {
        let id = FunctionId(self.functions.len() as u32);
        let ordinal = self.functions.len() as u32;
        self.segments
            .get_mut(&segment)
            .ok_or(AnalysisError::UnknownSegment(segment))?
            .insert_function(entry, id);
        self.functions
            .push(Function::new(id, ordinal, segment, entry));
        Ok(id)
    }

    /// Registers an additional entry offset for an existing function.
    pub fn add_alias(&mut self, segment: SegmentId, offset: u16, id: FunctionId) -> Result<()> {
        self.segments
            .get_mut(&segment)
            .ok_or(AnalysisError::UnknownSegment(segment))?
            .insert_function(offset, id);
        Ok(())
    }

    /// Functions whose entry lies in `segment`, ordered by entry offset.
    pub fn functions_in(&self, segment: SegmentId) -> Vec<&Function> {
        let Some(seg) = self.segments.get(&segment) else {
            return Vec::new();
        };
        seg.functions
            .iter()
            .filter_map(|(offset, id)| {
                let function = self.function(*id)?;
                (function.segment == segment && function.entry == *offset).then_some(function)
            })
            .collect()
    }

    pub fn set_source_name(&mut self, id: FunctionId, name: String) {
        self.source_names.insert(id, name);
    }

    /// Source-file name revealed by a hook call inside the function.
    pub fn source_name(&self, id: FunctionId) -> Option<&str> {
        self.source_names.get(&id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> Program {
        let mut program = Program::new();
        program.add_segment(Segment::new(SegmentId::resident(0x0000), vec![0x90; 0x40]));
        program.add_segment(Segment::new(SegmentId::resident(0x0010), vec![0x90; 0x20]));
        program.add_segment(Segment::new(SegmentId::new(2, 0x0000), vec![0x90; 0x10]));
        program
    }

    #[test]
    fn test_locate_by_paragraph_then_linear() {
        let program = program();
        assert_eq!(
            program.locate(SegOff::new(0x0010, 0x0004)),
            Some(CodeAddress::new(SegmentId::resident(0x0010), 4))
        );
        // 0000:0104 is inside segment 0010 by linear address
        assert_eq!(
            program.locate(SegOff::new(0x0000, 0x0104)),
            Some(CodeAddress::new(SegmentId::resident(0x0010), 4))
        );
        assert_eq!(program.locate(SegOff::new(0x0100, 0)), None);
    }

    #[test]
    fn test_create_and_lookup() {
        let mut program = program();
        let seg = SegmentId::resident(0x0010);
        let id = program.create_function(seg, 8).unwrap();
        assert_eq!(program.lookup(seg, 8), Some(id));
        assert_eq!(program.function(id).unwrap().entry, 8);

        program.add_alias(seg, 2, id).unwrap();
        assert_eq!(program.lookup(seg, 2), Some(id));
        assert_eq!(program.functions_in(seg).len(), 1);

        assert!(matches!(
            program.create_function(SegmentId::resident(0x0300), 0),
            Err(AnalysisError::UnknownSegment(_))
        ));
    }

    #[test]
    fn test_overlay_segment() {
        let program = program();
        assert_eq!(program.overlay_segment(2), Some(SegmentId::new(2, 0)));
        assert_eq!(program.overlay_segment(3), None);
    }
}
