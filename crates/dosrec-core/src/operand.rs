//! Instruction operand types.

use crate::{Condition, Register, SegOff, VariableKind};

/// An instruction operand.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Operand {
    /// Register operand.
    Register(Register),
    /// Immediate value.
    Immediate(Immediate),
    /// Memory reference.
    Memory(MemoryRef),
    /// Absolute `segment:offset` pointer (far calls and jumps).
    FarPointer(FarPointer),
    /// Relative branch displacement with its resolved in-segment target.
    Relative {
        /// Displacement from the end of the instruction.
        displacement: i16,
        /// Resolved target offset.
        target: u16,
    },
    /// Branch condition carried by IF pseudo-instructions.
    Condition(Condition),
    /// x87 register stack slot `st(n)`.
    FpuStack(u8),
    /// Entry point inside an overlay.
    OverlayTarget { overlay: u16, offset: u16 },
    /// One entry of a SWITCH case table.
    Case { value: i32, target: u16 },
    /// The default entry of a SWITCH case table.
    Default { target: u16 },
}

impl Operand {
    /// Creates a register operand.
    pub fn reg(reg: Register) -> Self {
        Self::Register(reg)
    }

    /// Creates an immediate operand of `size` bits.
    pub fn imm(value: i32, size: u8) -> Self {
        Self::Immediate(Immediate::new(value, size))
    }

    /// Creates a relative branch operand.
    pub fn relative(displacement: i16, target: u16) -> Self {
        Self::Relative {
            displacement,
            target,
        }
    }

    /// Creates a far pointer operand.
    pub fn far(address: SegOff) -> Self {
        Self::FarPointer(FarPointer {
            segment: address.segment,
            offset: address.offset,
            relocated: false,
        })
    }

    /// Returns true if this is a register operand.
    pub fn is_register(&self) -> bool {
        matches!(self, Self::Register(_))
    }

    /// Returns true if this is an immediate operand.
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate(_))
    }

    /// Returns true if this is a memory operand.
    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }

    /// Returns the register if this is a register operand.
    pub fn as_register(&self) -> Option<Register> {
        match self {
            Self::Register(reg) => Some(*reg),
            _ => None,
        }
    }

    /// Returns the immediate value if this is an immediate operand.
    pub fn as_immediate(&self) -> Option<i32> {
        match self {
            Self::Immediate(imm) => Some(imm.value),
            _ => None,
        }
    }

    /// Returns the memory reference if this is a memory operand.
    pub fn as_memory(&self) -> Option<&MemoryRef> {
        match self {
            Self::Memory(mem) => Some(mem),
            _ => None,
        }
    }

    /// Returns the in-segment branch target carried by this operand.
    pub fn branch_target(&self) -> Option<u16> {
        match self {
            Self::Relative { target, .. } => Some(*target),
            Self::Case { target, .. } | Self::Default { target } => Some(*target),
            _ => None,
        }
    }
}

/// The kind of link-time value an immediate actually holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinkFixup {
    /// A segment paragraph patched by the loader.
    Segment,
    /// An offset resolved by the linker.
    Offset,
}

/// Immediate value operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Immediate {
    /// The value, sign-extended.
    pub value: i32,
    /// Encoded size in bits.
    pub size: u8,
    /// Set when the value was fixed up at link or load time.
    pub fixup: Option<LinkFixup>,
}

impl Immediate {
    pub fn new(value: i32, size: u8) -> Self {
        Self {
            value,
            size,
            fixup: None,
        }
    }

    /// Returns the value truncated to 16 bits.
    pub fn as_u16(&self) -> u16 {
        self.value as u16
    }
}

/// Absolute far pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FarPointer {
    pub segment: u16,
    pub offset: u16,
    /// True when the segment half is covered by a load-time relocation.
    pub relocated: bool,
}

impl FarPointer {
    pub fn address(&self) -> SegOff {
        SegOff::new(self.segment, self.offset)
    }
}

/// Base/index combination selected by the ModR/M `r/m` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RmBase {
    BxSi,
    BxDi,
    BpSi,
    BpDi,
    Si,
    Di,
    Bp,
    Bx,
}

impl RmBase {
    /// Decodes the 3-bit `r/m` field.
    pub fn from_rm(rm: u8) -> Self {
        match rm & 0x7 {
            0 => Self::BxSi,
            1 => Self::BxDi,
            2 => Self::BpSi,
            3 => Self::BpDi,
            4 => Self::Si,
            5 => Self::Di,
            6 => Self::Bp,
            _ => Self::Bx,
        }
    }

    /// The `r/m` encoding of this base.
    pub fn rm(&self) -> u8 {
        match self {
            Self::BxSi => 0,
            Self::BxDi => 1,
            Self::BpSi => 2,
            Self::BpDi => 3,
            Self::Si => 4,
            Self::Di => 5,
            Self::Bp => 6,
            Self::Bx => 7,
        }
    }

    /// Registers read to form the address.
    pub fn registers(&self) -> &'static [Register] {
        match self {
            Self::BxSi => &[Register::BX, Register::SI],
            Self::BxDi => &[Register::BX, Register::DI],
            Self::BpSi => &[Register::BP, Register::SI],
            Self::BpDi => &[Register::BP, Register::DI],
            Self::Si => &[Register::SI],
            Self::Di => &[Register::DI],
            Self::Bp => &[Register::BP],
            Self::Bx => &[Register::BX],
        }
    }

    /// Returns true if BP takes part in the address (default segment SS).
    pub fn uses_bp(&self) -> bool {
        matches!(self, Self::BpSi | Self::BpDi | Self::Bp)
    }

    /// The index register added to a base register, if any.
    pub fn index(&self) -> Option<Register> {
        match self {
            Self::BxSi | Self::BpSi => Some(Register::SI),
            Self::BxDi | Self::BpDi => Some(Register::DI),
            _ => None,
        }
    }
}

/// Encoded displacement width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DisplacementSize {
    None,
    Byte,
    Word,
}

/// One of the 24 canonical 16-bit addressing shapes.
///
/// `mod` 0..=2 times the eight `r/m` values, where `mod 0, r/m 6` is the
/// direct (displacement-only) form instead of `[bp]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressingMode {
    /// `[disp16]`
    Direct,
    /// `[base + disp]`
    Based {
        base: RmBase,
        displacement: DisplacementSize,
    },
}

impl AddressingMode {
    /// Decodes the `mod` and `r/m` fields. Returns `None` for register form.
    pub fn from_modrm(mod_: u8, rm: u8) -> Option<Self> {
        let displacement = match mod_ {
            0 if rm & 0x7 == 6 => return Some(Self::Direct),
            0 => DisplacementSize::None,
            1 => DisplacementSize::Byte,
            2 => DisplacementSize::Word,
            _ => return None,
        };
        Some(Self::Based {
            base: RmBase::from_rm(rm),
            displacement,
        })
    }

    /// Index of the shape in `0..24` (`mod * 8 + rm`).
    pub fn shape(&self) -> u8 {
        match self {
            Self::Direct => 6,
            Self::Based { base, displacement } => {
                let mod_ = match displacement {
                    DisplacementSize::None => 0,
                    DisplacementSize::Byte => 1,
                    DisplacementSize::Word => 2,
                };
                mod_ * 8 + base.rm()
            }
        }
    }

    /// Registers read to form the address.
    pub fn registers(&self) -> &'static [Register] {
        match self {
            Self::Direct => &[],
            Self::Based { base, .. } => base.registers(),
        }
    }

    /// The base/index combination, if any.
    pub fn base(&self) -> Option<RmBase> {
        match self {
            Self::Direct => None,
            Self::Based { base, .. } => Some(*base),
        }
    }

    /// Number of displacement bytes that follow the ModR/M byte.
    pub fn displacement_len(&self) -> usize {
        match self {
            Self::Direct => 2,
            Self::Based { displacement, .. } => match displacement {
                DisplacementSize::None => 0,
                DisplacementSize::Byte => 1,
                DisplacementSize::Word => 2,
            },
        }
    }
}

/// The segment a memory operand is addressed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentBase {
    /// A segment register.
    Register(Register),
    /// A constant paragraph, after explicit segment loads were folded.
    Immediate { value: u16, relocated: bool },
}

/// Reference from a memory operand to a classified stack variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableRef {
    pub kind: VariableKind,
    /// BP displacement the variable was classified from.
    pub displacement: i16,
}

/// Memory reference operand.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRef {
    /// Addressing shape.
    pub mode: AddressingMode,
    /// Signed displacement (the absolute offset for the direct form).
    pub displacement: i16,
    /// Access size in bytes (0 when the instruction does not access data).
    pub size: u8,
    /// Effective segment.
    pub segment: SegmentBase,
    /// True when the segment came from an explicit override prefix.
    pub segment_override: bool,
    /// Stack variable this operand was classified as.
    pub variable: Option<VariableRef>,
}

impl MemoryRef {
    /// Creates a memory reference through the mode's default segment.
    pub fn new(mode: AddressingMode, displacement: i16, size: u8) -> Self {
        let segment = match mode.base() {
            Some(base) if base.uses_bp() => Register::SS,
            _ => Register::DS,
        };
        Self {
            mode,
            displacement,
            size,
            segment: SegmentBase::Register(segment),
            segment_override: false,
            variable: None,
        }
    }

    /// Creates a direct `[disp16]` reference through DS.
    pub fn direct(offset: u16, size: u8) -> Self {
        Self::new(AddressingMode::Direct, offset as i16, size)
    }

    /// Creates a `[base + disp]` reference.
    pub fn based(base: RmBase, displacement: i16, size: u8) -> Self {
        let width = if displacement == 0 && base != RmBase::Bp {
            DisplacementSize::None
        } else if (-128..=127).contains(&displacement) {
            DisplacementSize::Byte
        } else {
            DisplacementSize::Word
        };
        Self::new(
            AddressingMode::Based {
                base,
                displacement: width,
            },
            displacement,
            size,
        )
    }

    /// Applies a segment override.
    pub fn with_segment(mut self, segment: Register) -> Self {
        self.segment = SegmentBase::Register(segment);
        self.segment_override = true;
        self
    }

    /// Returns the segment register addressed, if not folded to a constant.
    pub fn segment_register(&self) -> Option<Register> {
        match self.segment {
            SegmentBase::Register(reg) => Some(reg),
            SegmentBase::Immediate { .. } => None,
        }
    }

    /// Returns true for a BP-relative access through the stack segment.
    pub fn is_frame_access(&self) -> bool {
        self.segment_register() == Some(Register::SS)
            && self.mode.base().map(|b| b.uses_bp()).unwrap_or(false)
    }

    /// Index register added to BP or BX, if any.
    pub fn index_register(&self) -> Option<Register> {
        self.mode.base().and_then(|b| b.index())
    }

    /// Returns true for the direct `[disp16]` shape.
    pub fn is_direct(&self) -> bool {
        self.mode == AddressingMode::Direct
    }
}

fn size_keyword(size: u8) -> &'static str {
    match size {
        1 => "byte ptr ",
        2 => "word ptr ",
        4 => "dword ptr ",
        8 => "qword ptr ",
        10 => "tbyte ptr ",
        _ => "",
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(reg) => write!(f, "{}", reg.name()),
            Self::Immediate(imm) => {
                if imm.fixup == Some(LinkFixup::Segment) {
                    write!(f, "seg {:#06x}", imm.as_u16())
                } else if imm.value < 0 {
                    write!(f, "-{:#x}", -(imm.value as i64))
                } else {
                    write!(f, "{:#x}", imm.value)
                }
            }
            Self::Memory(mem) => {
                write!(f, "{}", size_keyword(mem.size))?;
                if mem.segment_override {
                    if let SegmentBase::Register(seg) = mem.segment {
                        write!(f, "{}:", seg.name())?;
                    }
                }
                if let SegmentBase::Immediate { value, .. } = mem.segment {
                    write!(f, "{:#06x}:", value)?;
                }

                if let Some(var) = mem.variable {
                    let name = crate::Variable::default_name(var.kind, var.displacement);
                    return match mem.index_register() {
                        Some(index) => write!(f, "[{} + {}]", name, index.name()),
                        None => write!(f, "[{}]", name),
                    };
                }

                write!(f, "[")?;
                match mem.mode {
                    AddressingMode::Direct => write!(f, "{:#x}", mem.displacement as u16)?,
                    AddressingMode::Based { base, .. } => {
                        let regs = base.registers();
                        for (i, reg) in regs.iter().enumerate() {
                            if i > 0 {
                                write!(f, " + ")?;
                            }
                            write!(f, "{}", reg.name())?;
                        }
                        if mem.displacement > 0 {
                            write!(f, " + {:#x}", mem.displacement)?;
                        } else if mem.displacement < 0 {
                            write!(f, " - {:#x}", -(mem.displacement as i32))?;
                        }
                    }
                }
                write!(f, "]")
            }
            Self::FarPointer(ptr) => write!(f, "{:04x}:{:04x}", ptr.segment, ptr.offset),
            Self::Relative { target, .. } => write!(f, "{:#06x}", target),
            Self::Condition(cond) => write!(f, "{}", cond.x86_suffix()),
            Self::FpuStack(n) => write!(f, "st({})", n),
            Self::OverlayTarget { overlay, offset } => write!(f, "ovl{}:{:04x}", overlay, offset),
            Self::Case { value, target } => write!(f, "case {} => {:#06x}", value, target),
            Self::Default { target } => write!(f, "default => {:#06x}", target),
        }
    }
}
