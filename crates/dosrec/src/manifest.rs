//! Program manifests.
//!
//! A manifest describes how the bytes of one or more image files map onto
//! segments, and carries the per-program facts analysis cannot discover on
//! its own: entry points, the data segment and known hooks.
//!
//! ```json
//! {
//!   "images": ["GAME.BIN"],
//!   "segments": [
//!     { "segment": "1000", "start": 0, "length": 4096, "model": "far",
//!       "relocations": [{ "offset": 16, "kind": "segment" }] },
//!     { "overlay": 1, "segment": "0000", "start": 4096, "length": 512 }
//!   ],
//!   "entry_points": [{ "address": "1000:0000" }],
//!   "data_segment": "1200",
//!   "hooks": [{ "address": "1000:0F00", "kind": "source-name" }]
//! }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use dosrec_analysis::{AnalysisConfig, HookKind, KnownHook, Program};
use dosrec_core::{CallModel, CodeAddress, Relocation, SegOff, Segment, SegmentId};

#[derive(Debug, Deserialize)]
pub struct ProgramManifest {
    /// Image files, relative to the manifest's directory.
    pub images: Vec<PathBuf>,
    pub segments: Vec<SegmentEntry>,
    pub entry_points: Vec<EntryPoint>,
    /// Paragraph of the resident segment DS addresses.
    #[serde(default)]
    pub data_segment: Option<String>,
    /// Paragraph of the resident segment holding jump stubs.
    #[serde(default)]
    pub thunk_segment: Option<String>,
    #[serde(default)]
    pub hooks: Vec<HookEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SegmentEntry {
    /// Index into `images`.
    #[serde(default)]
    pub image: usize,
    #[serde(default)]
    pub overlay: u16,
    /// Paragraph in hex.
    pub segment: String,
    /// File offset of the first byte.
    pub start: usize,
    pub length: usize,
    #[serde(default)]
    pub model: CallModel,
    #[serde(default)]
    pub relocations: Vec<Relocation>,
}

#[derive(Debug, Deserialize)]
pub struct EntryPoint {
    #[serde(default)]
    pub overlay: u16,
    /// `SEG:OFF` in hex.
    pub address: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookEntryKind {
    Nop,
    SourceName,
}

#[derive(Debug, Deserialize)]
pub struct HookEntry {
    pub address: String,
    pub kind: HookEntryKind,
}

/// A program ready for analysis.
#[derive(Debug)]
pub struct LoadedProgram {
    pub program: Program,
    pub entries: Vec<CodeAddress>,
    pub data_segment: Option<SegmentId>,
    pub thunk_segment: Option<SegmentId>,
    pub hooks: Vec<KnownHook>,
}

impl LoadedProgram {
    /// The whole image as one resident segment, entered at `entry`.
    pub fn raw(image: Vec<u8>, entry: SegOff) -> Result<Self> {
        if image.len() > 0x10000 {
            bail!(
                "image is {} bytes; a raw image must fit one 64K segment (use --manifest)",
                image.len()
            );
        }
        let id = SegmentId::resident(entry.segment);
        let mut program = Program::new();
        program.add_segment(Segment::new(id, image));
        Ok(Self {
            program,
            entries: vec![CodeAddress::new(id, entry.offset)],
            data_segment: None,
            thunk_segment: None,
            hooks: Vec::new(),
        })
    }

    /// Applies the program's own settings on top of `config`.
    pub fn configure(&self, mut config: AnalysisConfig) -> AnalysisConfig {
        if let Some(data) = self.data_segment {
            config = config.with_data_segment(data);
        }
        if self.thunk_segment.is_some() {
            config = config.with_thunk_segment(self.thunk_segment);
        }
        for hook in &self.hooks {
            config = config.with_hook(*hook);
        }
        config
    }
}

impl ProgramManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))
    }

    /// Reads the images (relative to `base`) and builds the program.
    pub fn build(&self, base: &Path) -> Result<LoadedProgram> {
        let images = self
            .images
            .iter()
            .map(|name| {
                let path = base.join(name);
                fs::read(&path).with_context(|| format!("Failed to read image: {}", path.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut program = Program::new();
        let mut seen = BTreeSet::new();
        for entry in &self.segments {
            let id = SegmentId::new(entry.overlay, parse_paragraph(&entry.segment)?);
            if !seen.insert(id) {
                bail!("segment {} is declared twice", id);
            }
            let Some(image) = images.get(entry.image) else {
                bail!("segment {} refers to missing image #{}", id, entry.image);
            };
            if entry.length > 0x10000 {
                bail!("segment {} is longer than 64K", id);
            }
            let bytes = entry
                .start
                .checked_add(entry.length)
                .and_then(|end| image.get(entry.start..end))
                .with_context(|| {
                    format!(
                        "segment {} ({} bytes at {}) lies outside its image",
                        id, entry.length, entry.start
                    )
                })?;
            let mut segment = Segment::new(id, bytes.to_vec()).with_model(entry.model);
            for relocation in &entry.relocations {
                segment.add_relocation(*relocation);
            }
            program.add_segment(segment);
        }

        let entries = self
            .entry_points
            .iter()
            .map(|entry| {
                let address: SegOff = entry
                    .address
                    .parse()
                    .with_context(|| format!("Invalid entry point: {}", entry.address))?;
                Ok(CodeAddress::new(
                    SegmentId::new(entry.overlay, address.segment),
                    address.offset,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let hooks = self
            .hooks
            .iter()
            .map(|hook| {
                let target: SegOff = hook
                    .address
                    .parse()
                    .with_context(|| format!("Invalid hook address: {}", hook.address))?;
                let kind = match hook.kind {
                    HookEntryKind::Nop => HookKind::Nop,
                    HookEntryKind::SourceName => HookKind::SourceName,
                };
                Ok(KnownHook::new(target, kind))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LoadedProgram {
            program,
            entries,
            data_segment: resident(self.data_segment.as_deref())?,
            thunk_segment: resident(self.thunk_segment.as_deref())?,
            hooks,
        })
    }
}

fn resident(paragraph: Option<&str>) -> Result<Option<SegmentId>> {
    paragraph
        .map(|p| parse_paragraph(p).map(SegmentId::resident))
        .transpose()
}

fn parse_paragraph(s: &str) -> Result<u16> {
    let digits = s.trim();
    let digits = digits.strip_prefix("0x").unwrap_or(digits);
    u16::from_str_radix(digits, 16).with_context(|| format!("Invalid segment paragraph: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prog.bin"), [0xC3u8; 0x30]).unwrap();
        let manifest: ProgramManifest = serde_json::from_str(
            r#"{
                "images": ["prog.bin"],
                "segments": [
                    { "segment": "1000", "start": 0, "length": 32, "model": "near",
                      "relocations": [{ "offset": 4, "kind": "segment" }] },
                    { "overlay": 1, "segment": "0", "start": 32, "length": 16 }
                ],
                "entry_points": [{ "address": "1000:0000" }, { "overlay": 1, "address": "0:0002" }],
                "data_segment": "1000",
                "hooks": [{ "address": "1000:0010", "kind": "source-name" }]
            }"#,
        )
        .unwrap();

        let loaded = manifest.build(dir.path()).unwrap();
        let code = loaded.program.segment(SegmentId::resident(0x1000)).unwrap();
        assert_eq!(code.len(), 32);
        assert_eq!(code.model, CallModel::Near);
        assert!(code.has_segment_fixup(4));
        assert_eq!(loaded.program.segment(SegmentId::new(1, 0)).unwrap().len(), 16);
        assert_eq!(
            loaded.entries,
            vec![
                CodeAddress::new(SegmentId::resident(0x1000), 0),
                CodeAddress::new(SegmentId::new(1, 0), 2),
            ]
        );

        let config = loaded.configure(AnalysisConfig::default());
        assert_eq!(config.data_segment, Some(SegmentId::resident(0x1000)));
        assert!(config.hook_at(SegOff::new(0x1000, 0x10)).is_some());
    }

    #[test]
    fn test_segment_outside_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("prog.bin"), [0x90u8; 8]).unwrap();
        let manifest: ProgramManifest = serde_json::from_str(
            r#"{
                "images": ["prog.bin"],
                "segments": [{ "segment": "0", "start": 4, "length": 8 }],
                "entry_points": []
            }"#,
        )
        .unwrap();
        let err = manifest.build(dir.path()).unwrap_err();
        assert!(err.to_string().contains("outside its image"));
    }
}
