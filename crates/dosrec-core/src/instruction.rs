//! Real-mode instruction representation.

use crate::{Operand, Register, SegOff};

/// Branch condition for conditional jumps and IF pseudo-instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Condition {
    Overflow,
    NotOverflow,
    Below,        // CF=1
    AboveOrEqual, // CF=0
    Equal,
    NotEqual,
    BelowOrEqual, // CF=1 or ZF=1
    Above,        // CF=0 and ZF=0
    Sign,
    NotSign,
    Parity,
    NotParity,
    Less,           // SF!=OF
    GreaterOrEqual, // SF=OF
    LessOrEqual,    // ZF=1 or SF!=OF
    Greater,        // ZF=0 and SF=OF
}

impl Condition {
    /// Decodes the low nibble of a `Jcc` opcode.
    pub const fn from_code(code: u8) -> Self {
        match code & 0x0F {
            0x0 => Self::Overflow,
            0x1 => Self::NotOverflow,
            0x2 => Self::Below,
            0x3 => Self::AboveOrEqual,
            0x4 => Self::Equal,
            0x5 => Self::NotEqual,
            0x6 => Self::BelowOrEqual,
            0x7 => Self::Above,
            0x8 => Self::Sign,
            0x9 => Self::NotSign,
            0xA => Self::Parity,
            0xB => Self::NotParity,
            0xC => Self::Less,
            0xD => Self::GreaterOrEqual,
            0xE => Self::LessOrEqual,
            _ => Self::Greater,
        }
    }

    /// Returns the inverse condition.
    pub fn inverse(&self) -> Self {
        match self {
            Self::Overflow => Self::NotOverflow,
            Self::NotOverflow => Self::Overflow,
            Self::Below => Self::AboveOrEqual,
            Self::AboveOrEqual => Self::Below,
            Self::Equal => Self::NotEqual,
            Self::NotEqual => Self::Equal,
            Self::BelowOrEqual => Self::Above,
            Self::Above => Self::BelowOrEqual,
            Self::Sign => Self::NotSign,
            Self::NotSign => Self::Sign,
            Self::Parity => Self::NotParity,
            Self::NotParity => Self::Parity,
            Self::Less => Self::GreaterOrEqual,
            Self::GreaterOrEqual => Self::Less,
            Self::LessOrEqual => Self::Greater,
            Self::Greater => Self::LessOrEqual,
        }
    }

    /// Returns the x86 mnemonic suffix for this condition.
    pub fn x86_suffix(&self) -> &'static str {
        match self {
            Self::Overflow => "o",
            Self::NotOverflow => "no",
            Self::Below => "b",
            Self::AboveOrEqual => "ae",
            Self::Equal => "e",
            Self::NotEqual => "ne",
            Self::BelowOrEqual => "be",
            Self::Above => "a",
            Self::Sign => "s",
            Self::NotSign => "ns",
            Self::Parity => "p",
            Self::NotParity => "np",
            Self::Less => "l",
            Self::GreaterOrEqual => "ge",
            Self::LessOrEqual => "le",
            Self::Greater => "g",
        }
    }

    /// Returns the C-like comparison operator for fused comparisons.
    pub fn operator(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Below | Self::Less => "<",
            Self::BelowOrEqual | Self::LessOrEqual => "<=",
            Self::Above | Self::Greater => ">",
            Self::AboveOrEqual | Self::GreaterOrEqual => ">=",
            Self::Overflow => "overflow",
            Self::NotOverflow => "!overflow",
            Self::Sign => "<0",
            Self::NotSign => ">=0",
            Self::Parity => "parity",
            Self::NotParity => "!parity",
        }
    }
}

/// Instruction kinds: the real-mode instruction set plus the synthetic
/// pseudo-instructions produced by normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mnemonic {
    // Data movement
    Mov,
    Movsx,
    Movzx,
    Push,
    Pop,
    Pusha,
    Popa,
    Pushf,
    Popf,
    Xchg,
    Lea,
    Lds,
    Les,
    Lahf,
    Sahf,
    Xlat,
    Cbw,
    Cwd,
    In,
    Out,

    // Arithmetic
    Add,
    Adc,
    Sub,
    Sbb,
    Inc,
    Dec,
    Neg,
    Cmp,
    Mul,
    Imul,
    Div,
    Idiv,
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,

    // Logical
    And,
    Or,
    Xor,
    Not,
    Test,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,

    // String
    Movsb,
    Movsw,
    Cmpsb,
    Cmpsw,
    Scasb,
    Scasw,
    Lodsb,
    Lodsw,
    Stosb,
    Stosw,
    Insb,
    Insw,
    Outsb,
    Outsw,

    // Control flow
    Jmp,
    JmpFar,
    Jcc(Condition),
    Jcxz,
    Loop,
    Loope,
    Loopne,
    Call,
    CallFar,
    Ret,
    Retf,
    Int,
    Into,
    Iret,
    Enter,
    Leave,
    Bound,

    // Flags and processor control
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,
    Hlt,
    Wait,
    Nop,

    // x87
    Fld,
    Fild,
    Fst,
    Fstp,
    Fist,
    Fistp,
    Fadd,
    Fsub,
    Fsubr,
    Fmul,
    Fdiv,
    Fdivr,
    Fcom,
    Fcomp,
    Fcompp,
    Fxch,
    Fchs,
    Fabs,
    Ftst,
    Fldz,
    Fld1,
    Fstsw,
    Fstcw,
    Fldcw,
    Finit,
    Fclex,
    /// Any other coprocessor escape; operands carry the raw opcode.
    Fpu,

    // Synthetic
    /// Jump-table dispatch: selector, cases, default.
    Switch,
    /// Fused compare-and-branch: a, b, condition, target.
    If,
    /// Fused `a cond1 b && a cond2 b` branch: a, b, cond1, cond2, target.
    IfAnd,
    /// Fused `a cond1 b || a cond2 b` branch: a, b, cond1, cond2, target.
    IfOr,
    /// `PUSH hi; PUSH lo; POP r32`: destination, high word, low word.
    WordsToDword,
    /// Overlay-manager call.
    CallOverlay,
    /// `LEA r, mem; PUSH r`: pushes an effective address.
    PushAddress,
}

impl Mnemonic {
    /// Returns the lower-case mnemonic text.
    pub fn name(&self) -> &'static str {
        use Mnemonic::*;
        match self {
            Mov => "mov",
            Movsx => "movsx",
            Movzx => "movzx",
            Push => "push",
            Pop => "pop",
            Pusha => "pusha",
            Popa => "popa",
            Pushf => "pushf",
            Popf => "popf",
            Xchg => "xchg",
            Lea => "lea",
            Lds => "lds",
            Les => "les",
            Lahf => "lahf",
            Sahf => "sahf",
            Xlat => "xlat",
            Cbw => "cbw",
            Cwd => "cwd",
            In => "in",
            Out => "out",
            Add => "add",
            Adc => "adc",
            Sub => "sub",
            Sbb => "sbb",
            Inc => "inc",
            Dec => "dec",
            Neg => "neg",
            Cmp => "cmp",
            Mul => "mul",
            Imul => "imul",
            Div => "div",
            Idiv => "idiv",
            Daa => "daa",
            Das => "das",
            Aaa => "aaa",
            Aas => "aas",
            Aam => "aam",
            Aad => "aad",
            And => "and",
            Or => "or",
            Xor => "xor",
            Not => "not",
            Test => "test",
            Shl => "shl",
            Shr => "shr",
            Sar => "sar",
            Rol => "rol",
            Ror => "ror",
            Rcl => "rcl",
            Rcr => "rcr",
            Movsb => "movsb",
            Movsw => "movsw",
            Cmpsb => "cmpsb",
            Cmpsw => "cmpsw",
            Scasb => "scasb",
            Scasw => "scasw",
            Lodsb => "lodsb",
            Lodsw => "lodsw",
            Stosb => "stosb",
            Stosw => "stosw",
            Insb => "insb",
            Insw => "insw",
            Outsb => "outsb",
            Outsw => "outsw",
            Jmp => "jmp",
            JmpFar => "jmp far",
            Jcc(cond) => match cond {
                Condition::Overflow => "jo",
                Condition::NotOverflow => "jno",
                Condition::Below => "jb",
                Condition::AboveOrEqual => "jae",
                Condition::Equal => "je",
                Condition::NotEqual => "jne",
                Condition::BelowOrEqual => "jbe",
                Condition::Above => "ja",
                Condition::Sign => "js",
                Condition::NotSign => "jns",
                Condition::Parity => "jp",
                Condition::NotParity => "jnp",
                Condition::Less => "jl",
                Condition::GreaterOrEqual => "jge",
                Condition::LessOrEqual => "jle",
                Condition::Greater => "jg",
            },
            Jcxz => "jcxz",
            Loop => "loop",
            Loope => "loope",
            Loopne => "loopne",
            Call => "call",
            CallFar => "call far",
            Ret => "ret",
            Retf => "retf",
            Int => "int",
            Into => "into",
            Iret => "iret",
            Enter => "enter",
            Leave => "leave",
            Bound => "bound",
            Clc => "clc",
            Stc => "stc",
            Cmc => "cmc",
            Cld => "cld",
            Std => "std",
            Cli => "cli",
            Sti => "sti",
            Hlt => "hlt",
            Wait => "wait",
            Nop => "nop",
            Fld => "fld",
            Fild => "fild",
            Fst => "fst",
            Fstp => "fstp",
            Fist => "fist",
            Fistp => "fistp",
            Fadd => "fadd",
            Fsub => "fsub",
            Fsubr => "fsubr",
            Fmul => "fmul",
            Fdiv => "fdiv",
            Fdivr => "fdivr",
            Fcom => "fcom",
            Fcomp => "fcomp",
            Fcompp => "fcompp",
            Fxch => "fxch",
            Fchs => "fchs",
            Fabs => "fabs",
            Ftst => "ftst",
            Fldz => "fldz",
            Fld1 => "fld1",
            Fstsw => "fstsw",
            Fstcw => "fstcw",
            Fldcw => "fldcw",
            Finit => "finit",
            Fclex => "fclex",
            Fpu => "esc",
            Switch => "SWITCH",
            If => "IF",
            IfAnd => "IF-AND",
            IfOr => "IF-OR",
            WordsToDword => "WORDS-TO-DWORD",
            CallOverlay => "CALL-OVERLAY",
            PushAddress => "PUSH-ADDRESS",
        }
    }

    /// Returns true for RET, RETF and IRET.
    pub fn is_return(&self) -> bool {
        matches!(self, Self::Ret | Self::Retf | Self::Iret)
    }

    /// Returns true for branches that may fall through.
    pub fn is_conditional_branch(&self) -> bool {
        matches!(
            self,
            Self::Jcc(_)
                | Self::Jcxz
                | Self::Loop
                | Self::Loope
                | Self::Loopne
                | Self::If
                | Self::IfAnd
                | Self::IfOr
        )
    }

    /// Returns true for the flag-reading `Jcc` family (not the CX-based forms).
    pub fn reads_flags_for_branch(&self) -> bool {
        matches!(self, Self::Jcc(_) | Self::Loope | Self::Loopne)
    }

    /// Returns true for every call form.
    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call | Self::CallFar | Self::CallOverlay)
    }

    /// Returns true for the synthetic pseudo-instructions.
    pub fn is_synthetic(&self) -> bool {
        matches!(
            self,
            Self::Switch
                | Self::If
                | Self::IfAnd
                | Self::IfOr
                | Self::WordsToDword
                | Self::CallOverlay
                | Self::PushAddress
        )
    }

    /// Returns true for the string instructions that honour REP prefixes.
    pub fn is_string(&self) -> bool {
        matches!(
            self,
            Self::Movsb
                | Self::Movsw
                | Self::Cmpsb
                | Self::Cmpsw
                | Self::Scasb
                | Self::Scasw
                | Self::Lodsb
                | Self::Lodsw
                | Self::Stosb
                | Self::Stosw
                | Self::Insb
                | Self::Insw
                | Self::Outsb
                | Self::Outsw
        )
    }
}

impl std::fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// REP-family prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RepeatPrefix {
    /// REP / REPE / REPZ (0xF3)
    Rep,
    /// REPNE / REPNZ (0xF2)
    Repne,
}

/// Prefix flags that were applied to an instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Prefixes {
    /// Segment override register.
    pub segment: Option<Register>,
    /// REP/REPNE.
    pub repeat: Option<RepeatPrefix>,
    /// LOCK (0xF0).
    pub lock: bool,
    /// Operand-size override (0x66).
    pub operand_size: bool,
    /// Address-size override (0x67).
    pub address_size: bool,
}

/// Target of a direct call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallTarget {
    /// Offset in the caller's segment.
    Near(u16),
    /// Absolute `segment:offset`.
    Far(SegOff),
    /// Entry in an overlay.
    Overlay { overlay: u16, offset: u16 },
}

/// Control flow classification derived from mnemonic and operands.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlFlow {
    /// Falls through to the next instruction.
    Sequential,
    /// Unconditional near jump to a known offset.
    Jump { target: u16 },
    /// Unconditional jump to another segment.
    FarJump { target: SegOff },
    /// Conditional branch - may fall through or jump.
    ConditionalBranch { target: u16, fallthrough: u16 },
    /// Indirect jump (target in register or memory).
    IndirectJump,
    /// Resolved jump table.
    Switch { targets: Vec<u16> },
    /// Direct call.
    Call { target: CallTarget, return_addr: u16 },
    /// Indirect call.
    IndirectCall { return_addr: u16 },
    /// Return from function.
    Return,
    /// Terminates the program.
    Exit,
    /// Halts execution.
    Halt,
}

/// A decoded real-mode instruction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Instruction {
    /// Address of the first byte (including prefixes).
    pub address: SegOff,
    /// Encoded length in bytes.
    pub size: u8,
    /// Instruction kind.
    pub mnemonic: Mnemonic,
    /// Operands (destination first, then sources).
    pub operands: Vec<Operand>,
    /// Prefixes absorbed while decoding.
    pub prefixes: Prefixes,
    /// True if some branch in the function targets this instruction.
    pub is_label: bool,
    /// Label ordinal, assigned after normalization.
    pub label: Option<u32>,
    /// True if the instruction was synthesized rather than decoded.
    pub synthetic: bool,
}

impl Instruction {
    /// Creates a new instruction without operands.
    pub fn new(address: SegOff, size: u8, mnemonic: Mnemonic) -> Self {
        Self {
            address,
            size,
            mnemonic,
            operands: Vec::new(),
            prefixes: Prefixes::default(),
            is_label: false,
            label: None,
            synthetic: false,
        }
    }

    /// Adds an operand.
    pub fn with_operand(mut self, op: Operand) -> Self {
        self.operands.push(op);
        self
    }

    /// Sets operands.
    pub fn with_operands(mut self, ops: Vec<Operand>) -> Self {
        self.operands = ops;
        self
    }

    /// Sets prefixes.
    pub fn with_prefixes(mut self, prefixes: Prefixes) -> Self {
        self.prefixes = prefixes;
        self
    }

    /// Offset of this instruction in its segment.
    pub fn offset(&self) -> u16 {
        self.address.offset
    }

    /// Offset of the byte following this instruction.
    pub fn end_offset(&self) -> u16 {
        self.address.offset.wrapping_add(self.size as u16)
    }

    /// Returns the first operand.
    pub fn op(&self, idx: usize) -> Option<&Operand> {
        self.operands.get(idx)
    }

    /// Classifies the control flow of this instruction.
    pub fn control_flow(&self) -> ControlFlow {
        use Mnemonic::*;
        let next = self.end_offset();
        match self.mnemonic {
            Jmp => match self.operands.first() {
                Some(Operand::Relative { target, .. }) => ControlFlow::Jump { target: *target },
                _ => ControlFlow::IndirectJump,
            },
            JmpFar => match self.operands.first() {
                Some(Operand::FarPointer(ptr)) => ControlFlow::FarJump {
                    target: ptr.address(),
                },
                _ => ControlFlow::IndirectJump,
            },
            Jcc(_) | Jcxz | Loop | Loope | Loopne | If | IfAnd | IfOr => {
                match self.operands.iter().rev().find_map(Operand::branch_target) {
                    Some(target) => ControlFlow::ConditionalBranch {
                        target,
                        fallthrough: next,
                    },
                    None => ControlFlow::Sequential,
                }
            }
            Switch => ControlFlow::Switch {
                targets: self.operands.iter().filter_map(Operand::branch_target).collect(),
            },
            Call | CallFar | CallOverlay => {
                let target = match self.operands.first() {
                    Some(Operand::Relative { target, .. }) => Some(CallTarget::Near(*target)),
                    Some(Operand::FarPointer(ptr)) if self.mnemonic == CallFar => {
                        Some(CallTarget::Far(ptr.address()))
                    }
                    Some(Operand::FarPointer(ptr)) if ptr.segment == self.address.segment => {
                        Some(CallTarget::Near(ptr.offset))
                    }
                    Some(Operand::FarPointer(ptr)) => Some(CallTarget::Far(ptr.address())),
                    Some(Operand::OverlayTarget { overlay, offset }) => {
                        Some(CallTarget::Overlay {
                            overlay: *overlay,
                            offset: *offset,
                        })
                    }
                    _ => None,
                };
                match target {
                    Some(target) => ControlFlow::Call {
                        target,
                        return_addr: next,
                    },
                    None => ControlFlow::IndirectCall { return_addr: next },
                }
            }
            Ret | Retf | Iret => ControlFlow::Return,
            Int => match self.operands.first().and_then(Operand::as_immediate) {
                Some(0x20) | Some(0x27) => ControlFlow::Exit,
                _ => ControlFlow::Sequential,
            },
            Hlt => ControlFlow::Halt,
            _ => ControlFlow::Sequential,
        }
    }

    /// In-segment offsets this instruction may transfer control to
    /// (excluding fall-through).
    pub fn branch_targets(&self) -> Vec<u16> {
        match self.control_flow() {
            ControlFlow::Jump { target } => vec![target],
            ControlFlow::ConditionalBranch { target, .. } => vec![target],
            ControlFlow::Switch { targets } => targets,
            _ => Vec::new(),
        }
    }

    /// Returns true if execution can continue with the next instruction.
    pub fn falls_through(&self) -> bool {
        !matches!(
            self.control_flow(),
            ControlFlow::Jump { .. }
                | ControlFlow::FarJump { .. }
                | ControlFlow::IndirectJump
                | ControlFlow::Switch { .. }
                | ControlFlow::Return
                | ControlFlow::Exit
                | ControlFlow::Halt
        )
    }

    /// Returns true if this is a return-class instruction.
    pub fn is_return(&self) -> bool {
        self.mnemonic.is_return()
    }

    /// Returns true if this is an unconditional near jump with a known target.
    pub fn is_direct_jump(&self) -> bool {
        matches!(self.control_flow(), ControlFlow::Jump { .. })
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(rep) = self.prefixes.repeat {
            if self.mnemonic.is_string() {
                match rep {
                    RepeatPrefix::Rep => write!(f, "rep ")?,
                    RepeatPrefix::Repne => write!(f, "repne ")?,
                }
            }
        }
        if self.prefixes.lock {
            write!(f, "lock ")?;
        }
        write!(f, "{}", self.mnemonic)?;

        if !self.operands.is_empty() {
            write!(f, " ")?;
            for (i, op) in self.operands.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", op)?;
            }
        }

        Ok(())
    }
}
