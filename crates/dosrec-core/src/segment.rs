//! Code segments, relocations and global variables.

use std::collections::BTreeMap;

use crate::{Error, FunctionId, SegmentId};

/// What a relocation patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RelocationKind {
    /// A 16-bit segment paragraph.
    Segment,
    /// A 16-bit offset.
    Offset,
    /// A 32-bit `offset:segment` far pointer.
    Pointer,
}

/// A load-time relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Relocation {
    /// Offset of the patched word within the segment.
    pub offset: u16,
    pub kind: RelocationKind,
    /// Segment paragraph the relocated value refers to, when known.
    #[cfg_attr(feature = "serde", serde(default))]
    pub target_segment: Option<u16>,
}

impl Relocation {
    /// Bytes covered by this relocation.
    pub fn width(&self) -> u16 {
        match self.kind {
            RelocationKind::Pointer => 4,
            _ => 2,
        }
    }

    /// Returns true if the segment word of this relocation starts at `offset`.
    pub fn patches_segment_at(&self, offset: u16) -> bool {
        match self.kind {
            RelocationKind::Segment => self.offset == offset,
            RelocationKind::Pointer => self.offset.wrapping_add(2) == offset,
            RelocationKind::Offset => false,
        }
    }
}

/// Memory model a segment was compiled with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum CallModel {
    /// All functions return with RET.
    Near,
    /// All functions return with RETF.
    Far,
    /// No constraint.
    #[default]
    Mixed,
}

/// A global variable discovered through direct memory operands.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GlobalVariable {
    /// Offset in the data segment.
    pub offset: u16,
    /// Widest access size, in bytes.
    pub size: u8,
    /// Accessed through an index register.
    pub is_array: bool,
    pub name: String,
}

impl GlobalVariable {
    pub fn new(offset: u16, size: u8) -> Self {
        Self {
            offset,
            size,
            is_array: false,
            name: format!("g_{:04X}", offset),
        }
    }
}

/// A code segment with its bytes and everything discovered in it.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub id: SegmentId,
    /// Segment contents starting at offset 0.
    pub data: Vec<u8>,
    /// Relocations keyed by patched offset.
    pub relocations: BTreeMap<u16, Relocation>,
    pub model: CallModel,
    /// Functions keyed by entry offset.
    pub functions: BTreeMap<u16, FunctionId>,
    /// Globals keyed by offset (populated on the data segment).
    pub globals: BTreeMap<u16, GlobalVariable>,
}

impl Segment {
    pub fn new(id: SegmentId, data: Vec<u8>) -> Self {
        Self {
            id,
            data,
            relocations: BTreeMap::new(),
            model: CallModel::Mixed,
            functions: BTreeMap::new(),
            globals: BTreeMap::new(),
        }
    }

    pub fn with_model(mut self, model: CallModel) -> Self {
        self.model = model;
        self
    }

    pub fn add_relocation(&mut self, relocation: Relocation) {
        self.relocations.insert(relocation.offset, relocation);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, offset: u16) -> bool {
        (offset as usize) < self.data.len()
    }

    /// Linear address of offset 0.
    pub fn linear_base(&self) -> u32 {
        (self.id.segment as u32) << 4
    }

    /// Returns true if `linear` falls inside this segment.
    pub fn contains_linear(&self, linear: u32) -> bool {
        linear >= self.linear_base() && linear < self.linear_base() + self.data.len() as u32
    }

    pub fn read_u8(&self, offset: u16) -> Result<u8, Error> {
        self.data
            .get(offset as usize)
            .copied()
            .ok_or(Error::OffsetOutOfBounds {
                segment: self.id,
                offset: offset as u32,
            })
    }

    pub fn read_u16(&self, offset: u16) -> Result<u16, Error> {
        let bytes = self.bytes_at(offset, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Returns `len` bytes starting at `offset`.
    pub fn bytes_at(&self, offset: u16, len: usize) -> Result<&[u8], Error> {
        let start = offset as usize;
        self.data
            .get(start..start + len)
            .ok_or(Error::OffsetOutOfBounds {
                segment: self.id,
                offset: (start + len) as u32,
            })
    }

    /// Bytes from `offset` to the end of the segment.
    pub fn tail(&self, offset: u16) -> &[u8] {
        self.data.get(offset as usize..).unwrap_or(&[])
    }

    /// Relocation patching exactly `offset`.
    pub fn relocation_at(&self, offset: u16) -> Option<&Relocation> {
        self.relocations.get(&offset)
    }

    /// Returns true if a relocation patches a segment word at `offset`.
    pub fn has_segment_fixup(&self, offset: u16) -> bool {
        self.relocations
            .range(offset.saturating_sub(2)..=offset)
            .any(|(_, reloc)| reloc.patches_segment_at(offset))
    }

    /// Relocations overlapping `start..start+len`.
    pub fn relocations_in(&self, start: u16, len: u16) -> impl Iterator<Item = &Relocation> {
        let end = start as u32 + len as u32;
        self.relocations
            .range(start.saturating_sub(3)..)
            .map(|(_, reloc)| reloc)
            .take_while(move |reloc| (reloc.offset as u32) < end)
            .filter(move |reloc| reloc.offset as u32 + reloc.width() as u32 > start as u32)
    }

    pub fn function_at(&self, offset: u16) -> Option<FunctionId> {
        self.functions.get(&offset).copied()
    }

    pub fn insert_function(&mut self, offset: u16, id: FunctionId) {
        self.functions.insert(offset, id);
    }

    /// Records an access to a global, widening size and array flag.
    pub fn record_global(&mut self, offset: u16, size: u8, indexed: bool) -> &GlobalVariable {
        let global = self
            .globals
            .entry(offset)
            .or_insert_with(|| GlobalVariable::new(offset, size));
        global.size = global.size.max(size);
        global.is_array |= indexed;
        global
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment() -> Segment {
        let mut seg = Segment::new(SegmentId::resident(0x10), vec![0x9A, 0x00, 0x00, 0x20, 0x00, 0xC3]);
        seg.add_relocation(Relocation {
            offset: 1,
            kind: RelocationKind::Pointer,
            target_segment: Some(0x20),
        });
        seg
    }

    #[test]
    fn test_reads() {
        let seg = segment();
        assert_eq!(seg.read_u8(5).unwrap(), 0xC3);
        assert_eq!(seg.read_u16(3).unwrap(), 0x0020);
        assert!(seg.read_u16(5).is_err());
        assert!(seg.read_u8(6).is_err());
    }

    #[test]
    fn test_pointer_relocation_covers_segment_word() {
        let seg = segment();
        assert!(seg.has_segment_fixup(3));
        assert!(!seg.has_segment_fixup(1));
        assert_eq!(seg.relocations_in(0, 5).count(), 1);
        assert_eq!(seg.relocations_in(5, 1).count(), 0);
    }

    #[test]
    fn test_record_global_widens() {
        let mut seg = Segment::new(SegmentId::resident(0), Vec::new());
        seg.record_global(0x42, 1, false);
        let global = seg.record_global(0x42, 2, true);
        assert_eq!(global.size, 2);
        assert!(global.is_array);
        assert_eq!(global.name, "g_0042");
    }

    #[test]
    fn test_linear_containment() {
        let seg = segment();
        assert!(seg.contains_linear(0x100));
        assert!(seg.contains_linear(0x105));
        assert!(!seg.contains_linear(0x106));
    }
}
