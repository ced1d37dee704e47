//! Recovered functions, calling conventions and stack frames.

use std::collections::BTreeMap;

use crate::{Instruction, SegmentId};

/// Index of a function in the program registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionId(pub u32);

impl std::fmt::Display for FunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Return distance of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallDistance {
    /// Returns with RET.
    Near,
    /// Returns with RETF.
    Far,
}

/// Who removes arguments from the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StackCleanup {
    /// The caller adjusts SP after the call (C convention).
    Caller,
    /// The callee pops its arguments with `RET n` (Pascal convention).
    Callee,
}

/// Calling convention inferred from the function's return instructions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallingConvention {
    pub distance: Option<CallDistance>,
    pub cleanup: Option<StackCleanup>,
    /// Bytes popped by `RET n`.
    pub argument_bytes: u16,
}

impl CallingConvention {
    /// Returns true once a return instruction has been seen.
    pub fn is_known(&self) -> bool {
        self.distance.is_some()
    }

    /// BP displacement just past the saved BP and return address, where
    /// parameter positions are counted from.
    pub fn parameter_base(&self) -> i16 {
        match self.distance {
            Some(CallDistance::Near) => 4,
            _ => 6,
        }
    }
}

impl std::fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let distance = match self.distance {
            Some(CallDistance::Near) => "near",
            Some(CallDistance::Far) => "far",
            None => "unknown",
        };
        match self.cleanup {
            Some(StackCleanup::Callee) => write!(f, "{} pascal({})", distance, self.argument_bytes),
            Some(StackCleanup::Caller) => write!(f, "{} cdecl", distance),
            None => write!(f, "{}", distance),
        }
    }
}

/// Whether a stack variable lives above or below the saved BP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VariableKind {
    Parameter,
    Local,
}

/// A classified BP-relative stack variable.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Variable {
    pub kind: VariableKind,
    /// BP displacement of the first access.
    pub displacement: i16,
    /// Offset within the parameter block or local area.
    pub offset: u16,
    /// Widest access size seen, in bytes.
    pub size: u8,
    /// Accessed through an index register.
    pub is_array: bool,
    pub name: String,
}

impl Variable {
    pub fn new(kind: VariableKind, displacement: i16, offset: u16, size: u8) -> Self {
        Self {
            kind,
            displacement,
            offset,
            size,
            is_array: false,
            name: Self::default_name(kind, displacement),
        }
    }

    /// `arg_N` for parameters, `var_N` for locals, N being |displacement| in hex.
    pub fn default_name(kind: VariableKind, displacement: i16) -> String {
        let magnitude = displacement.unsigned_abs();
        match kind {
            VariableKind::Parameter => format!("arg_{:X}", magnitude),
            VariableKind::Local => format!("var_{:X}", magnitude),
        }
    }
}

/// Stack frame layout of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackFrame {
    /// BP is set up as a frame pointer.
    pub has_frame: bool,
    /// Bytes reserved below BP.
    pub local_size: u16,
    /// Parameters keyed by BP displacement.
    pub parameters: BTreeMap<i16, Variable>,
    /// Locals keyed by BP displacement.
    pub locals: BTreeMap<i16, Variable>,
}

impl StackFrame {
    /// Looks up a variable by kind and displacement.
    pub fn variable(&self, kind: VariableKind, displacement: i16) -> Option<&Variable> {
        match kind {
            VariableKind::Parameter => self.parameters.get(&displacement),
            VariableKind::Local => self.locals.get(&displacement),
        }
    }
}

/// What a function turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionKind {
    /// Ordinary code that is disassembled and analyzed.
    Code,
    /// Matched against a library module; not disassembled.
    Library { module: String },
}

/// Processing state of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FunctionState {
    /// Registered; its body has not been disassembled yet.
    Pending,
    /// Disassembled and analyzed.
    Built,
}

/// A recovered function.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Function {
    pub id: FunctionId,
    /// Position in discovery order, used for default names.
    pub ordinal: u32,
    pub segment: SegmentId,
    pub entry: u16,
    /// Symbol name, if known.
    pub name: Option<String>,
    pub kind: FunctionKind,
    pub convention: CallingConvention,
    /// Instructions sorted by address.
    pub instructions: Vec<Instruction>,
    pub frame: StackFrame,
    pub state: FunctionState,
}

impl Function {
    /// Creates a pending code function.
    pub fn new(id: FunctionId, ordinal: u32, segment: SegmentId, entry: u16) -> Self {
        Self {
            id,
            ordinal,
            segment,
            entry,
            name: None,
            kind: FunctionKind::Code,
            convention: CallingConvention::default(),
            instructions: Vec::new(),
            frame: StackFrame::default(),
            state: FunctionState::Pending,
        }
    }

    /// Returns the symbol name or `sub_N`.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("sub_{}", self.ordinal),
        }
    }

    pub fn is_library(&self) -> bool {
        matches!(self.kind, FunctionKind::Library { .. })
    }

    /// Index of the instruction at `offset`.
    pub fn instruction_index(&self, offset: u16) -> Option<usize> {
        self.instructions
            .binary_search_by_key(&offset, |inst| inst.address.offset)
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names() {
        assert_eq!(Variable::default_name(VariableKind::Parameter, 6), "arg_6");
        assert_eq!(Variable::default_name(VariableKind::Local, -0x12), "var_12");
    }

    #[test]
    fn test_parameter_base() {
        let mut conv = CallingConvention::default();
        assert_eq!(conv.parameter_base(), 6);
        conv.distance = Some(CallDistance::Near);
        assert_eq!(conv.parameter_base(), 4);
    }

    #[test]
    fn test_display_name() {
        let mut func = Function::new(FunctionId(0), 3, SegmentId::resident(0), 0x10);
        assert_eq!(func.display_name(), "sub_3");
        func.name = Some("_main".into());
        assert_eq!(func.display_name(), "_main");
    }
}
