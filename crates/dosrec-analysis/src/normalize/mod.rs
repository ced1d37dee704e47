//! Compiler-idiom normalization.
//!
//! Each pass is a single left-to-right scan producing a new instruction
//! list; passes run in the fixed order of [`NormalizePass::all`]. Deleted
//! instructions simply vanish from the output, and any branch that pointed
//! at one is retargeted to the next surviving instruction when labels are
//! reassigned at the end.

mod conditional;
mod far_call;
mod goto;
mod hooks;
mod lea_push;
mod segment_fold;
mod word_pair;
mod zeroing;

use std::collections::BTreeSet;

use tracing::debug;

use dosrec_core::{Instruction, Operand, Segment};

use crate::config::{AnalysisConfig, NormalizePass};
use crate::engine::mark_labels;

/// Result of normalizing one body.
#[derive(Debug, Clone, Default)]
pub struct NormalizeOutput {
    /// Rewritten instructions with labels assigned.
    pub instructions: Vec<Instruction>,
    /// Source-file names revealed by removed hook calls.
    pub source_names: Vec<String>,
    /// Hook calls removed.
    pub hooks_removed: usize,
}

/// Runs the enabled normalization passes over a function body.
pub struct Normalizer<'a> {
    config: &'a AnalysisConfig,
    code: &'a Segment,
    data: Option<&'a Segment>,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a AnalysisConfig, code: &'a Segment) -> Self {
        Self {
            config,
            code,
            data: None,
        }
    }

    /// Segment hook string arguments are read from.
    pub fn with_data_segment(mut self, data: Option<&'a Segment>) -> Self {
        self.data = data;
        self
    }

    /// Normalizes address-sorted `instructions`.
    pub fn run(&self, mut instructions: Vec<Instruction>) -> NormalizeOutput {
        let mut output = NormalizeOutput::default();
        mark_labels(&mut instructions);

        for pass in self.config.normalizer.enabled_passes() {
            let before = instructions.len();
            instructions = match pass {
                NormalizePass::Hooks => {
                    let strings = self.data.unwrap_or(self.code);
                    let removed = hooks::apply(instructions, self.config, strings);
                    output.source_names.extend(removed.source_names);
                    output.hooks_removed += removed.calls;
                    removed.instructions
                }
                NormalizePass::GotoCollapse => goto::apply(instructions),
                NormalizePass::FarCall => far_call::apply(instructions),
                NormalizePass::Zeroing => zeroing::apply(instructions),
                NormalizePass::WordPair => word_pair::apply(instructions),
                NormalizePass::LeaPush => lea_push::apply(instructions),
                NormalizePass::SegmentFold => segment_fold::apply(instructions),
                NormalizePass::Conditional => conditional::apply(instructions),
            };
            debug!(
                pass = pass.name(),
                before,
                after = instructions.len(),
                "normalization pass"
            );
        }

        assign_labels(&mut instructions);
        output.instructions = instructions;
        output
    }
}

/// Retargets branches at deleted instructions, then flags and numbers
/// every label in address order starting from 1.
pub fn assign_labels(instructions: &mut [Instruction]) {
    let offsets: BTreeSet<u16> = instructions.iter().map(Instruction::offset).collect();
    for inst in instructions.iter_mut() {
        if inst.mnemonic.is_call() {
            continue;
        }
        for op in &mut inst.operands {
            let target = match op {
                Operand::Relative { target, .. }
                | Operand::Case { target, .. }
                | Operand::Default { target } => target,
                _ => continue,
            };
            if offsets.contains(target) {
                continue;
            }
            if let Some(next) = offsets.range(*target..).next() {
                *target = *next;
            }
        }
    }

    mark_labels(instructions);
    let mut ordinal = 0;
    for inst in instructions.iter_mut() {
        inst.label = if inst.is_label {
            ordinal += 1;
            Some(ordinal)
        } else {
            None
        };
    }
}

/// `target - end` as the displacement of a relative operand.
pub(crate) fn displacement_to(inst: &Instruction, target: u16) -> i16 {
    target.wrapping_sub(inst.end_offset()) as i16
}
