//! # dosrec-core
//!
//! Core abstractions for recovering functions from 16-bit real-mode x86 code.
//! This crate defines the data model shared by the decoder, the analysis
//! passes and the library matcher: addresses, registers, operands,
//! instructions, functions, stack frames and segments.

pub mod address;
pub mod error;
pub mod function;
pub mod instruction;
pub mod operand;
pub mod output;
pub mod register;
pub mod segment;

pub use address::{CodeAddress, SegOff, SegmentId};
pub use error::Error;
pub use function::{
    CallDistance, CallingConvention, Function, FunctionId, FunctionKind, FunctionState,
    StackCleanup, StackFrame, Variable, VariableKind,
};
pub use instruction::{
    CallTarget, Condition, ControlFlow, Instruction, Mnemonic, Prefixes, RepeatPrefix,
};
pub use operand::{
    AddressingMode, DisplacementSize, FarPointer, Immediate, LinkFixup, MemoryRef, Operand,
    RmBase, SegmentBase, VariableRef,
};
pub use output::FunctionListing;
pub use register::{Register, RegisterClass};
pub use segment::{CallModel, GlobalVariable, Relocation, RelocationKind, Segment};
