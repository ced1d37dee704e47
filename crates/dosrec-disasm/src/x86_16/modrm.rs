//! ModR/M byte decoding for 16-bit addressing.

use dosrec_core::{AddressingMode, MemoryRef, Operand, Prefixes, Register};

/// Decoded ModR/M byte.
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    /// Mod field (2 bits)
    pub mod_: u8,
    /// Reg field (3 bits)
    pub reg: u8,
    /// R/M field (3 bits)
    pub rm: u8,
}

impl ModRM {
    /// Parse a ModR/M byte.
    pub fn parse(byte: u8) -> Self {
        Self {
            mod_: (byte >> 6) & 0x3,
            reg: (byte >> 3) & 0x7,
            rm: byte & 0x7,
        }
    }

    /// Returns true if this ModR/M encodes a register operand (mod=11).
    pub fn is_register(&self) -> bool {
        self.mod_ == 0b11
    }
}

/// Decode the r/m operand.
///
/// `bytes` starts right after the ModR/M byte. Returns the operand and the
/// number of displacement bytes consumed, or `None` if the displacement is
/// truncated.
pub fn decode_modrm_rm(
    bytes: &[u8],
    modrm: ModRM,
    prefixes: &Prefixes,
    operand_size: u16,
) -> Option<(Operand, usize)> {
    let mode = match AddressingMode::from_modrm(modrm.mod_, modrm.rm) {
        Some(mode) => mode,
        None => {
            return Some((
                Operand::reg(Register::from_encoding(modrm.rm, operand_size)),
                0,
            ))
        }
    };

    let consumed = mode.displacement_len();
    let displacement = match consumed {
        0 => 0,
        1 => *bytes.first()? as i8 as i16,
        _ => i16::from_le_bytes([*bytes.first()?, *bytes.get(1)?]),
    };

    let mut mem = MemoryRef::new(mode, displacement, (operand_size / 8) as u8);
    if let Some(segment) = prefixes.segment {
        mem = mem.with_segment(segment);
    }
    Some((Operand::Memory(mem), consumed))
}

/// Decode the reg field as a general register.
pub fn decode_modrm_reg(modrm: ModRM, operand_size: u16) -> Operand {
    Operand::reg(Register::from_encoding(modrm.reg, operand_size))
}

/// Decode the reg field as a segment register.
pub fn decode_sreg(modrm: ModRM) -> Option<Operand> {
    if modrm.reg < 6 {
        Some(Operand::reg(Register::segment(modrm.reg as u16)))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dosrec_core::{RmBase, SegmentBase};

    #[test]
    fn test_bp_disp8() {
        // [bp-4]
        let modrm = ModRM::parse(0x46);
        let (op, len) = decode_modrm_rm(&[0xFC], modrm, &Prefixes::default(), 16).unwrap();
        assert_eq!(len, 1);
        let mem = op.as_memory().unwrap();
        assert_eq!(mem.displacement, -4);
        assert_eq!(mem.mode.base(), Some(RmBase::Bp));
        assert!(mem.is_frame_access());
    }

    #[test]
    fn test_direct_address() {
        // [0x1234]
        let modrm = ModRM::parse(0x06);
        let (op, len) = decode_modrm_rm(&[0x34, 0x12], modrm, &Prefixes::default(), 8).unwrap();
        assert_eq!(len, 2);
        let mem = op.as_memory().unwrap();
        assert!(mem.is_direct());
        assert_eq!(mem.displacement as u16, 0x1234);
        assert_eq!(mem.segment, SegmentBase::Register(Register::DS));
        assert_eq!(mem.size, 1);
    }

    #[test]
    fn test_truncated_displacement() {
        let modrm = ModRM::parse(0x86);
        assert!(decode_modrm_rm(&[0x00], modrm, &Prefixes::default(), 16).is_none());
    }

    #[test]
    fn test_register_form() {
        let modrm = ModRM::parse(0xC4);
        let (op, len) = decode_modrm_rm(&[], modrm, &Prefixes::default(), 8).unwrap();
        assert_eq!(len, 0);
        assert_eq!(op.as_register(), Some(Register::AH));
    }
}
