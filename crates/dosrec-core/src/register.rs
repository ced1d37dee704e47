//! Real-mode register representation.
//!
//! General registers are identified by their 16-bit encoding number and a
//! size; the byte halves `AL`..`BL` and `AH`..`BH` alias the low and high
//! lanes of `AX`..`BX`, and the 386 `EAX`..`EDI` widen them with an upper
//! word. Aliasing is modelled with lane masks so that a write to `AL` does
//! not count as overwriting `AX`, while a read of `AH` counts as a read of
//! `AX`.

/// Register class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RegisterClass {
    /// AX, CX, DX, BX, SP, BP, SI, DI and their byte/dword forms.
    General,
    /// ES, CS, SS, DS, FS, GS.
    Segment,
    /// The flags word.
    Flags,
}

/// A register with its access size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Register {
    /// The class of register.
    pub class: RegisterClass,
    /// Encoding number within the class (see [`x86`]).
    pub id: u16,
    /// Size of the access in bits.
    pub size: u16,
    /// True for the high byte of a word register (AH, CH, DH, BH).
    pub high: bool,
}

// Encoding numbers
pub mod x86 {
    pub const AX: u16 = 0;
    pub const CX: u16 = 1;
    pub const DX: u16 = 2;
    pub const BX: u16 = 3;
    pub const SP: u16 = 4;
    pub const BP: u16 = 5;
    pub const SI: u16 = 6;
    pub const DI: u16 = 7;

    pub const ES: u16 = 0;
    pub const CS: u16 = 1;
    pub const SS: u16 = 2;
    pub const DS: u16 = 3;
    pub const FS: u16 = 4;
    pub const GS: u16 = 5;
}

const LANE_LOW: u8 = 0b001;
const LANE_HIGH: u8 = 0b010;
const LANE_UPPER: u8 = 0b100;

impl Register {
    pub const AL: Register = Register::gpr(x86::AX, 8);
    pub const CL: Register = Register::gpr(x86::CX, 8);
    pub const DL: Register = Register::gpr(x86::DX, 8);
    pub const BL: Register = Register::gpr(x86::BX, 8);
    pub const AH: Register = Register::high_byte(x86::AX);
    pub const CH: Register = Register::high_byte(x86::CX);
    pub const DH: Register = Register::high_byte(x86::DX);
    pub const BH: Register = Register::high_byte(x86::BX);

    pub const AX: Register = Register::gpr(x86::AX, 16);
    pub const CX: Register = Register::gpr(x86::CX, 16);
    pub const DX: Register = Register::gpr(x86::DX, 16);
    pub const BX: Register = Register::gpr(x86::BX, 16);
    pub const SP: Register = Register::gpr(x86::SP, 16);
    pub const BP: Register = Register::gpr(x86::BP, 16);
    pub const SI: Register = Register::gpr(x86::SI, 16);
    pub const DI: Register = Register::gpr(x86::DI, 16);

    pub const EAX: Register = Register::gpr(x86::AX, 32);
    pub const EDX: Register = Register::gpr(x86::DX, 32);

    pub const ES: Register = Register::segment(x86::ES);
    pub const CS: Register = Register::segment(x86::CS);
    pub const SS: Register = Register::segment(x86::SS);
    pub const DS: Register = Register::segment(x86::DS);
    pub const FS: Register = Register::segment(x86::FS);
    pub const GS: Register = Register::segment(x86::GS);

    pub const FLAGS: Register = Register::new(RegisterClass::Flags, 0, 16, false);

    /// Creates a new register.
    pub const fn new(class: RegisterClass, id: u16, size: u16, high: bool) -> Self {
        Self {
            class,
            id,
            size,
            high,
        }
    }

    /// Creates a general register (low byte for size 8).
    pub const fn gpr(id: u16, size: u16) -> Self {
        Self::new(RegisterClass::General, id, size, false)
    }

    /// Creates the high byte of a word register (AH, CH, DH, BH).
    pub const fn high_byte(id: u16) -> Self {
        Self::new(RegisterClass::General, id, 8, true)
    }

    /// Creates a segment register.
    pub const fn segment(id: u16) -> Self {
        Self::new(RegisterClass::Segment, id, 16, false)
    }

    /// Decodes an 8-bit register from its 3-bit encoding (AL..BL, AH..BH).
    pub const fn byte_from_encoding(num: u8) -> Self {
        if num < 4 {
            Self::gpr(num as u16, 8)
        } else {
            Self::high_byte((num - 4) as u16)
        }
    }

    /// Decodes a general register of the given size from its 3-bit encoding.
    pub const fn from_encoding(num: u8, size: u16) -> Self {
        if size == 8 {
            Self::byte_from_encoding(num)
        } else {
            Self::gpr((num & 0x7) as u16, size)
        }
    }

    /// Returns true for a segment register.
    pub fn is_segment(&self) -> bool {
        self.class == RegisterClass::Segment
    }

    /// Returns true for a general register.
    pub fn is_general(&self) -> bool {
        self.class == RegisterClass::General
    }

    /// The 16-bit register containing this one (AX for AL, AH and EAX).
    pub fn word(&self) -> Register {
        match self.class {
            RegisterClass::General => Self::gpr(self.id, 16),
            _ => *self,
        }
    }

    fn lanes(&self) -> u8 {
        match (self.class, self.size, self.high) {
            (RegisterClass::General, 8, false) => LANE_LOW,
            (RegisterClass::General, 8, true) => LANE_HIGH,
            (RegisterClass::General, 32, _) => LANE_LOW | LANE_HIGH | LANE_UPPER,
            _ => LANE_LOW | LANE_HIGH,
        }
    }

    /// Returns true if the two registers share any storage.
    pub fn overlaps(&self, other: &Register) -> bool {
        self.class == other.class && self.id == other.id && self.lanes() & other.lanes() != 0
    }

    /// Returns true if writing `self` overwrites all of `other`.
    pub fn covers(&self, other: &Register) -> bool {
        self.class == other.class
            && self.id == other.id
            && self.lanes() & other.lanes() == other.lanes()
    }

    /// Returns the canonical name for this register.
    pub fn name(&self) -> &'static str {
        const WORD: [&str; 8] = ["ax", "cx", "dx", "bx", "sp", "bp", "si", "di"];
        const DWORD: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        const LOW: [&str; 4] = ["al", "cl", "dl", "bl"];
        const HIGH: [&str; 4] = ["ah", "ch", "dh", "bh"];
        const SEGMENT: [&str; 6] = ["es", "cs", "ss", "ds", "fs", "gs"];

        let id = self.id as usize;
        match self.class {
            RegisterClass::General => match (self.size, self.high) {
                (8, false) => LOW.get(id).copied().unwrap_or("?"),
                (8, true) => HIGH.get(id).copied().unwrap_or("?"),
                (32, _) => DWORD.get(id).copied().unwrap_or("?"),
                _ => WORD.get(id).copied().unwrap_or("?"),
            },
            RegisterClass::Segment => SEGMENT.get(id).copied().unwrap_or("?"),
            RegisterClass::Flags => "flags",
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_aliasing() {
        assert!(Register::AL.overlaps(&Register::AX));
        assert!(Register::AH.overlaps(&Register::AX));
        assert!(!Register::AL.overlaps(&Register::AH));
        assert!(Register::EAX.overlaps(&Register::AH));
        assert!(!Register::AL.overlaps(&Register::CL));
    }

    #[test]
    fn test_covers() {
        assert!(Register::AX.covers(&Register::AL));
        assert!(Register::AX.covers(&Register::AH));
        assert!(!Register::AL.covers(&Register::AX));
        assert!(!Register::AX.covers(&Register::EAX));
        assert!(Register::EAX.covers(&Register::AX));
    }

    #[test]
    fn test_segment_does_not_alias_general() {
        // ES and AX share encoding number 0
        assert!(!Register::ES.overlaps(&Register::AX));
    }

    #[test]
    fn test_names() {
        assert_eq!(Register::byte_from_encoding(4).name(), "ah");
        assert_eq!(Register::from_encoding(7, 16).name(), "di");
        assert_eq!(Register::from_encoding(0, 32).name(), "eax");
        assert_eq!(Register::DS.name(), "ds");
    }
}
