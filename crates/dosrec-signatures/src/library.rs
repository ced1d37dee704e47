//! Object-library model: modules, code segments, fixups and public names.
//!
//! Libraries are stored as JSON with code bytes as hex strings, e.g.
//!
//! ```json
//! {
//!   "name": "clib",
//!   "modules": [{
//!     "name": "STRLEN",
//!     "segments": [{
//!       "name": "_TEXT", "class": "CODE",
//!       "data": "55 8B EC 8B 7E 04",
//!       "fixups": [],
//!       "publics": [{ "name": "_strlen", "offset": 0 }]
//!     }]
//!   }]
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{LibraryError, Result};

/// What a fixup patches at link time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixupKind {
    /// A 16-bit offset.
    Offset16,
    /// A 16-bit segment paragraph (becomes a load-time relocation).
    Segment16,
    /// A 32-bit `offset:segment` far pointer.
    Pointer32,
    /// A 16-bit self-relative displacement.
    Relative16,
}

impl FixupKind {
    /// Bytes patched by this fixup.
    pub fn width(&self) -> u16 {
        match self {
            Self::Pointer32 => 4,
            _ => 2,
        }
    }
}

/// A fixup record of a module segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixup {
    pub kind: FixupKind,
    /// Offset of the patched bytes within the segment data.
    pub data_offset: u16,
    /// Symbol or segment the fixup refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A public symbol defined by a module segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicName {
    pub name: String,
    pub offset: u16,
}

/// One named segment of an object module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSegment {
    pub name: String,
    /// Segment class, e.g. `CODE` or `DATA`.
    pub class: String,
    #[serde(with = "crate::hex::serde_hex")]
    pub data: Vec<u8>,
    /// Fixups ordered by `data_offset`.
    #[serde(default)]
    pub fixups: Vec<Fixup>,
    #[serde(default)]
    pub publics: Vec<PublicName>,
}

impl ModuleSegment {
    pub fn new(name: impl Into<String>, class: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            data,
            fixups: Vec::new(),
            publics: Vec::new(),
        }
    }

    pub fn with_fixup(mut self, kind: FixupKind, data_offset: u16) -> Self {
        self.fixups.push(Fixup {
            kind,
            data_offset,
            target: None,
        });
        self.fixups.sort_by_key(|f| f.data_offset);
        self
    }

    pub fn with_public(mut self, name: impl Into<String>, offset: u16) -> Self {
        self.publics.push(PublicName {
            name: name.into(),
            offset,
        });
        self
    }

    /// Returns true for code segments (class ending in `CODE`).
    pub fn is_code(&self) -> bool {
        self.class.to_ascii_uppercase().ends_with("CODE")
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The fixup starting exactly at `offset`.
    pub fn fixup_at(&self, offset: u16) -> Option<&Fixup> {
        self.fixups
            .binary_search_by_key(&offset, |f| f.data_offset)
            .ok()
            .map(|idx| &self.fixups[idx])
    }

    /// Symbol for `offset`: the public defined there, or the nearest
    /// preceding public with a `+0xNN` suffix.
    pub fn symbol_at(&self, offset: u16, module: &str) -> String {
        if let Some(public) = self.publics.iter().find(|p| p.offset == offset) {
            return public.name.clone();
        }
        let base = self
            .publics
            .iter()
            .filter(|p| p.offset < offset)
            .max_by_key(|p| p.offset);
        match base {
            Some(public) => format!("{}+0x{:X}", public.name, offset - public.offset),
            None => format!("{}+0x{:X}", module, offset),
        }
    }

    fn validate(&self, module: &str) -> Result<()> {
        let invalid = |reason: String| LibraryError::InvalidModule {
            module: module.to_string(),
            reason,
        };
        let mut end = 0u32;
        for fixup in &self.fixups {
            let start = fixup.data_offset as u32;
            if start < end {
                return Err(invalid(format!(
                    "fixup at {:#x} overlaps the previous one in {}",
                    start, self.name
                )));
            }
            end = start + fixup.kind.width() as u32;
            if end as usize > self.data.len() {
                return Err(invalid(format!(
                    "fixup at {:#x} runs past the end of {}",
                    start, self.name
                )));
            }
        }
        Ok(())
    }
}

/// An object module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectModule {
    pub name: String,
    pub segments: Vec<ModuleSegment>,
}

impl ObjectModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            segments: Vec::new(),
        }
    }

    pub fn with_segment(mut self, segment: ModuleSegment) -> Self {
        self.segments.push(segment);
        self
    }

    /// Code segments with their index in `segments`.
    pub fn code_segments(&self) -> impl Iterator<Item = (usize, &ModuleSegment)> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| seg.is_code())
    }
}

/// A library of object modules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLibrary {
    pub name: String,
    pub modules: Vec<ObjectModule>,
}

impl ObjectLibrary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modules: Vec::new(),
        }
    }

    pub fn add(&mut self, module: ObjectModule) {
        self.modules.push(module);
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Sorts fixups and checks that they lie inside their segment data.
    pub fn validate(&mut self) -> Result<()> {
        for module in &mut self.modules {
            for segment in &mut module.segments {
                segment.fixups.sort_by_key(|f| f.data_offset);
                segment.validate(&module.name)?;
            }
        }
        Ok(())
    }

    /// Parse a library from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut library: Self = serde_json::from_str(json)?;
        library.validate()?;
        Ok(library)
    }

    /// Load a library from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Save the library to a JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
