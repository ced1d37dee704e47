//! Property-based tests for the real-mode decoder.
//!
//! These tests verify invariants that should hold for any input:
//! - Decoding never panics on arbitrary input
//! - Decoded instruction size is within valid bounds
//! - Deterministic decoding (same input → same output)
//! - Errors are reported at the requested address

use proptest::prelude::*;

use dosrec_core::{ControlFlow, SegOff};
use dosrec_disasm::{DecodeError, Decoder16, Disassembler};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    /// Decoding arbitrary bytes should never panic.
    #[test]
    fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..24)) {
        let decoder = Decoder16::new();
        let _ = decoder.decode_instruction(&bytes, SegOff::new(0x1000, 0));
    }

    /// Successfully decoded instructions have valid size.
    #[test]
    fn decoded_size_is_valid(bytes in prop::collection::vec(any::<u8>(), 1..24)) {
        let decoder = Decoder16::new();
        if let Ok(decoded) = decoder.decode_instruction(&bytes, SegOff::new(0x1000, 0)) {
            prop_assert!(decoded.size >= 1);
            prop_assert!(decoded.size <= decoder.max_instruction_size());
            prop_assert!(decoded.size <= bytes.len());
            prop_assert_eq!(decoded.size, decoded.instruction.size as usize);
        }
    }

    /// Decoding is deterministic: same input always produces same output.
    #[test]
    fn decode_is_deterministic(bytes in prop::collection::vec(any::<u8>(), 1..24)) {
        let decoder = Decoder16::new();
        let first = decoder.decode_instruction(&bytes, SegOff::new(0x1000, 0x10));
        let second = decoder.decode_instruction(&bytes, SegOff::new(0x1000, 0x10));

        match (&first, &second) {
            (Ok(d1), Ok(d2)) => {
                prop_assert_eq!(&d1.instruction, &d2.instruction);
            }
            (Err(e1), Err(e2)) => {
                prop_assert_eq!(e1, e2);
            }
            _ => {
                prop_assert!(false, "Decode results should be consistent: got {:?} and {:?}", first, second);
            }
        }
    }

    /// Decoded instructions and errors carry the requested address.
    #[test]
    fn decoded_address_matches(
        bytes in prop::collection::vec(any::<u8>(), 1..24),
        segment in any::<u16>(),
        offset in any::<u16>(),
    ) {
        let decoder = Decoder16::new();
        let address = SegOff::new(segment, offset);
        match decoder.decode_instruction(&bytes, address) {
            Ok(decoded) => prop_assert_eq!(decoded.instruction.address, address),
            Err(err) => prop_assert_eq!(err.address(), address),
        }
    }

    /// Any proper prefix of a successfully decoded instruction is truncated.
    #[test]
    fn prefix_of_instruction_is_truncated(bytes in prop::collection::vec(any::<u8>(), 2..24)) {
        let decoder = Decoder16::new();
        if let Ok(decoded) = decoder.decode_instruction(&bytes, SegOff::new(0, 0)) {
            for len in 1..decoded.size {
                let result = decoder.decode_instruction(&bytes[..len], SegOff::new(0, 0));
                prop_assert!(
                    matches!(result, Err(DecodeError::Truncated { .. })),
                    "{} of {} bytes decoded as {:?}", len, decoded.size, result
                );
            }
        }
    }

    /// Relative branch targets are computed modulo the 64K segment.
    #[test]
    fn short_jump_target_wraps(offset in any::<u16>(), disp in any::<i8>()) {
        let decoder = Decoder16::new();
        let decoded = decoder
            .decode_instruction(&[0xEB, disp as u8], SegOff::new(0, offset))
            .unwrap();
        let expected = offset.wrapping_add(2).wrapping_add(disp as i16 as u16);
        prop_assert_eq!(decoded.instruction.control_flow(), ControlFlow::Jump { target: expected });
    }
}

#[test]
fn linear_block_covers_every_byte() {
    let decoder = Decoder16::new();
    let code = [
        0x55, // push bp
        0x8B, 0xEC, // mov bp, sp
        0x83, 0xEC, 0x04, // sub sp, 4
        0xC7, 0x46, 0xFE, 0x00, 0x00, // mov word ptr [bp-2], 0
        0x8B, 0x46, 0x04, // mov ax, [bp+4]
        0x8B, 0xE5, // mov sp, bp
        0x5D, // pop bp
        0xC3, // ret
    ];
    let results = decoder.disassemble_block(&code, SegOff::new(0, 0));
    assert_eq!(results.len(), 8);
    let total: usize = results
        .iter()
        .map(|r| r.as_ref().unwrap().size as usize)
        .sum();
    assert_eq!(total, code.len());
}
