//! # dosrec-analysis
//!
//! Function recovery for 16-bit real-mode x86 programs.
//!
//! This crate provides:
//! - Worklist disassembly of function bodies with jump-table recovery
//! - Register and segment liveness queries over recovered bodies
//! - Compiler-idiom normalization (goto collapse, far calls, fused
//!   conditionals, word pairs, segment folding)
//! - Calling-convention inference and stack-frame classification
//! - Call-graph discovery driven from entry points, binding statically
//!   linked library routines by fuzzy module matching

pub mod callgraph;
pub mod config;
pub mod convention;
pub mod dataflow;
pub mod engine;
pub mod error;
pub mod normalize;
pub mod program;
pub mod resolver;
pub mod stack_frame;
pub mod switch_recovery;

pub use callgraph::{CallGraph, CallKind, CallSite};
pub use config::{AnalysisConfig, HookKind, KnownHook, NormalizePass, NormalizerConfig};
pub use dataflow::{InstructionEffects, Liveness};
pub use engine::{DisassemblyEngine, EngineOutput};
pub use error::{AnalysisError, Result};
pub use normalize::{NormalizeOutput, Normalizer};
pub use program::{AnalysisStats, Program};
pub use resolver::Resolver;
pub use stack_frame::FrameClassifier;
pub use switch_recovery::{SwitchShape, SwitchTable};
