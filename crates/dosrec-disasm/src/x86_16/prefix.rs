//! x86 prefix parsing.

use dosrec_core::{Prefixes, Register, RepeatPrefix};

/// Parse prefixes from the start of an instruction.
/// Returns the prefixes and the number of bytes consumed.
pub fn parse(bytes: &[u8]) -> (Prefixes, usize) {
    let mut prefixes = Prefixes::default();
    let mut offset = 0;

    while offset < bytes.len() {
        match bytes[offset] {
            // Group 1: LOCK and repeat
            0xF0 => prefixes.lock = true,
            0xF2 => prefixes.repeat = Some(RepeatPrefix::Repne),
            0xF3 => prefixes.repeat = Some(RepeatPrefix::Rep),

            // Group 2: Segment overrides
            0x26 => prefixes.segment = Some(Register::ES),
            0x2E => prefixes.segment = Some(Register::CS),
            0x36 => prefixes.segment = Some(Register::SS),
            0x3E => prefixes.segment = Some(Register::DS),
            0x64 => prefixes.segment = Some(Register::FS),
            0x65 => prefixes.segment = Some(Register::GS),

            // Group 3: Operand size override
            0x66 => prefixes.operand_size = true,

            // Group 4: Address size override
            0x67 => prefixes.address_size = true,

            // Not a prefix
            _ => break,
        }

        offset += 1;
    }

    (prefixes, offset)
}

/// Effective operand size in bits for a word-sized opcode.
pub fn word_size(prefixes: &Prefixes) -> u16 {
    if prefixes.operand_size {
        32
    } else {
        16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absorbs_prefix_run() {
        let (prefixes, len) = parse(&[0xF3, 0x26, 0xA4]);
        assert_eq!(len, 2);
        assert_eq!(prefixes.repeat, Some(RepeatPrefix::Rep));
        assert_eq!(prefixes.segment, Some(Register::ES));
    }

    #[test]
    fn test_last_segment_override_wins() {
        let (prefixes, len) = parse(&[0x2E, 0x36, 0x8B]);
        assert_eq!(len, 2);
        assert_eq!(prefixes.segment, Some(Register::SS));
    }

    #[test]
    fn test_operand_size() {
        let (prefixes, _) = parse(&[0x66, 0x50]);
        assert_eq!(word_size(&prefixes), 32);
        let (prefixes, len) = parse(&[0x50]);
        assert_eq!(len, 0);
        assert_eq!(word_size(&prefixes), 16);
    }
}
