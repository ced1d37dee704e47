//! Property tests for the library matcher.

use dosrec_core::{Segment, SegmentId};
use dosrec_signatures::{FixupKind, LibraryMatcher, ModuleSegment, ObjectLibrary, ObjectModule};
use proptest::prelude::*;

fn library_with(segment: ModuleSegment) -> ObjectLibrary {
    let mut library = ObjectLibrary::new("props");
    library.add(ObjectModule::new("MOD").with_segment(segment));
    library
}

proptest! {
    /// Without fixups, matching reduces to byte equality.
    #[test]
    fn fixup_free_match_is_byte_equality(
        module in prop::collection::vec(any::<u8>(), 1..32),
        image in prop::collection::vec(any::<u8>(), 1..32),
    ) {
        let segment = ModuleSegment::new("_TEXT", "CODE", module.clone());
        let library = library_with(segment.clone());
        let matcher = LibraryMatcher::new(&library);
        let exe = Segment::new(SegmentId::resident(0), image.clone());

        let expected = image.len() >= module.len() && image[..module.len()] == module[..];
        let result = matcher.match_window(&segment, &exe, 0);
        prop_assert_eq!(result.is_some(), expected);
        if let Some(length) = result {
            prop_assert_eq!(length as usize, module.len());
        }
    }

    /// Changing any byte outside a fixup breaks the match.
    #[test]
    fn one_byte_difference_fails(
        module in prop::collection::vec(any::<u8>(), 1..32),
        index in any::<prop::sample::Index>(),
        delta in 1u8..=255,
    ) {
        let segment = ModuleSegment::new("_TEXT", "CODE", module.clone());
        let library = library_with(segment.clone());
        let matcher = LibraryMatcher::new(&library);

        let mut image = module.clone();
        let at = index.index(image.len());
        image[at] = image[at].wrapping_add(delta);
        let exe = Segment::new(SegmentId::resident(0), image);
        prop_assert_eq!(matcher.match_window(&segment, &exe, 0), None);
    }

    /// Bytes covered by an offset fixup never influence the result.
    #[test]
    fn offset_fixup_bytes_are_ignored(
        prefix in prop::collection::vec(any::<u8>(), 0..8),
        patched in any::<u16>(),
    ) {
        let mut module = prefix.clone();
        module.extend_from_slice(&[0xB8, 0x00, 0x00, 0xC3]);
        let segment = ModuleSegment::new("_TEXT", "CODE", module.clone())
            .with_fixup(FixupKind::Offset16, prefix.len() as u16 + 1);
        let library = library_with(segment.clone());
        let matcher = LibraryMatcher::new(&library);

        let mut image = module.clone();
        let at = prefix.len() + 1;
        image[at..at + 2].copy_from_slice(&patched.to_le_bytes());
        let exe = Segment::new(SegmentId::resident(0), image);
        prop_assert_eq!(matcher.match_window(&segment, &exe, 0), Some(module.len() as u16));
    }
}

#[test]
fn scan_reports_every_non_overlapping_occurrence() {
    let body = vec![0x55, 0x8B, 0xEC, 0x5D, 0xCB];
    let library = library_with(ModuleSegment::new("_TEXT", "CODE", body.clone()).with_public("_f", 0));
    let mut image = body.clone();
    image.extend_from_slice(&[0xCC; 3]);
    image.extend_from_slice(&body);
    let exe = Segment::new(SegmentId::resident(0x1000), image);

    let set = LibraryMatcher::new(&library).scan_all([&exe]);
    let starts: Vec<u16> = set.iter().map(|m| m.start).collect();
    assert_eq!(starts, vec![0, 8]);
    let second = set.find(SegmentId::resident(0x1000), 9).unwrap();
    assert_eq!(second.symbol_at(&library, 9), "_f+0x1");
}
