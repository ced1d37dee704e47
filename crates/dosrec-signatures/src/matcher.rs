//! Fuzzy matching of library modules against program code.
//!
//! Module bytes and program bytes are compared with two cursors moving
//! together. Positions the linker patched are skipped instead of compared:
//! a segment or far-pointer fixup in the module must line up with a
//! load-time relocation in the program, while offset and self-relative
//! fixups have no relocation and are skipped outright.

use tracing::{debug, trace};

use dosrec_core::{Segment, SegmentId};

use crate::library::{FixupKind, ModuleSegment, ObjectLibrary};

/// `CALL FAR` opcode.
const CALL_FAR: u8 = 0x9A;
/// `JMP FAR` opcode.
const JMP_FAR: u8 = 0xEA;

/// Program bytes a far call is rewritten to when the linker finds the
/// target in the same segment: `NOP; PUSH CS; CALL rel16`.
const NEAR_CALL_FORM: [u8; 3] = [0x90, 0x0E, 0xE8];
/// Program bytes a far jump is rewritten to: `NOP; NOP; JMP rel16`.
const NEAR_JMP_FORM: [u8; 3] = [0x90, 0x90, 0xE9];

/// Default minimum module length considered by [`LibraryMatcher::scan`].
pub const DEFAULT_MIN_LENGTH: usize = 4;

/// A program address range bound to one library module segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMatch {
    /// Module name.
    pub module: String,
    /// Name of the matched module segment.
    pub module_segment: String,
    /// Program segment containing the match.
    pub segment: SegmentId,
    /// First matched offset.
    pub start: u16,
    /// Matched length; always the module segment's code length.
    pub length: u16,
    module_index: usize,
    segment_index: usize,
}

impl ModuleMatch {
    /// Offset one past the match.
    pub fn end(&self) -> u32 {
        self.start as u32 + self.length as u32
    }

    /// Returns true if `offset` lies inside the match.
    pub fn contains(&self, offset: u16) -> bool {
        offset >= self.start && (offset as u32) < self.end()
    }

    /// Library symbol for a program offset inside this match.
    pub fn symbol_at(&self, library: &ObjectLibrary, offset: u16) -> String {
        let relative = offset.wrapping_sub(self.start);
        library
            .modules
            .get(self.module_index)
            .and_then(|module| module.segments.get(self.segment_index))
            .map(|segment| segment.symbol_at(relative, &self.module))
            .unwrap_or_else(|| format!("{}+0x{:X}", self.module, relative))
    }
}

/// All module matches of a program, ordered by segment and start.
#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    matches: Vec<ModuleMatch>,
}

impl MatchSet {
    pub fn new(mut matches: Vec<ModuleMatch>) -> Self {
        matches.sort_by_key(|m| (m.segment, m.start));
        Self { matches }
    }

    /// The match covering `segment:offset`, preferring the latest start.
    pub fn find(&self, segment: SegmentId, offset: u16) -> Option<&ModuleMatch> {
        self.matches
            .iter()
            .filter(|m| m.segment == segment && m.contains(offset))
            .max_by_key(|m| m.start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleMatch> {
        self.matches.iter()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

/// Slides library modules over program code.
pub struct LibraryMatcher<'a> {
    library: &'a ObjectLibrary,
    min_length: usize,
}

impl<'a> LibraryMatcher<'a> {
    /// Create a new matcher for the given library.
    pub fn new(library: &'a ObjectLibrary) -> Self {
        Self {
            library,
            min_length: DEFAULT_MIN_LENGTH,
        }
    }

    /// Skip module segments shorter than `min_length` bytes when scanning.
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length.max(1);
        self
    }

    /// Recognizes a far call/jump that the program holds in its near form.
    /// Returns the number of bytes both cursors advance.
    fn far_translation(module: &ModuleSegment, pos: usize, image: &[u8]) -> Option<usize> {
        let opcode = *module.data.get(pos)?;
        let near_form = match opcode {
            CALL_FAR => NEAR_CALL_FORM,
            JMP_FAR => NEAR_JMP_FORM,
            _ => return None,
        };
        let fixup = module.fixup_at((pos + 1) as u16)?;
        if fixup.kind != FixupKind::Pointer32 {
            return None;
        }
        let window = image.get(pos..pos + 5)?;
        if window[..3] == near_form {
            Some(5)
        } else {
            None
        }
    }

    /// Compares one module segment against the program at `start`.
    ///
    /// Returns the matched length, or `None` at the first byte that cannot
    /// be explained by a fixup.
    pub fn match_window(&self, module: &ModuleSegment, exe: &Segment, start: u16) -> Option<u16> {
        let code = &module.data;
        let length = u16::try_from(code.len()).ok()?;
        let image = exe.tail(start);
        if image.len() < code.len() {
            return None;
        }

        let mut pos = 0usize;
        while pos < code.len() {
            let exe_offset = start.wrapping_add(pos as u16);

            if let Some(fixup) = module.fixup_at(pos as u16) {
                let compatible = match fixup.kind {
                    FixupKind::Segment16 => exe.has_segment_fixup(exe_offset),
                    FixupKind::Pointer32 => exe.has_segment_fixup(exe_offset.wrapping_add(2)),
                    FixupKind::Offset16 | FixupKind::Relative16 => {
                        !exe.has_segment_fixup(exe_offset)
                    }
                };
                if !compatible {
                    return None;
                }
                pos += fixup.kind.width() as usize;
                continue;
            }

            if let Some(advance) = Self::far_translation(module, pos, image) {
                pos += advance;
                continue;
            }

            if code[pos] != image[pos] || exe.has_segment_fixup(exe_offset) {
                return None;
            }
            pos += 1;
        }

        Some(length)
    }

    /// Scans one program segment for every module code segment.
    pub fn scan(&self, exe: &Segment) -> Vec<ModuleMatch> {
        let mut matches = Vec::new();

        for (module_index, module) in self.library.modules.iter().enumerate() {
            for (segment_index, code) in module.code_segments() {
                if code.len() < self.min_length {
                    continue;
                }

                let mut pos = 0usize;
                while pos + code.len() <= exe.len() {
                    match self.match_window(code, exe, pos as u16) {
                        Some(length) => {
                            debug!(
                                module = %module.name,
                                segment = %exe.id,
                                start = %format!("{:04X}", pos),
                                length,
                                "library module matched"
                            );
                            matches.push(ModuleMatch {
                                module: module.name.clone(),
                                module_segment: code.name.clone(),
                                segment: exe.id,
                                start: pos as u16,
                                length,
                                module_index,
                                segment_index,
                            });
                            pos += length as usize;
                        }
                        None => {
                            trace!(module = %module.name, offset = pos, "window rejected");
                            pos += 1;
                        }
                    }
                }
            }
        }

        matches
    }

    /// Scans every segment and collects the matches.
    pub fn scan_all<'s>(&self, segments: impl IntoIterator<Item = &'s Segment>) -> MatchSet {
        let matches = segments
            .into_iter()
            .flat_map(|segment| self.scan(segment))
            .collect();
        MatchSet::new(matches)
    }
}
