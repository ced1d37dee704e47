//! Analysis configuration.
//!
//! [`AnalysisConfig`] gathers everything that steers a run: decoder
//! options, which normalization passes run, how strictly function frames
//! are checked, the switch-recovery window and the known no-op hooks.

use std::collections::HashSet;

use dosrec_core::{SegOff, SegmentId};
use dosrec_disasm::DecoderOptions;

/// Individual normalization passes that can be enabled or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormalizePass {
    /// Remove calls to known no-op hooks, harvesting source names.
    Hooks,
    /// Retarget chained jumps and drop jumps to the next instruction.
    GotoCollapse,
    /// Give relative calls absolute targets; fuse `PUSH CS; CALL`.
    FarCall,
    /// Turn `XOR r,r` / `SUB r,r` into `MOV r,0`.
    Zeroing,
    /// Fuse `PUSH; PUSH; POP r32` into WORDS-TO-DWORD.
    WordPair,
    /// Fuse `LEA r,m; PUSH r` into PUSH-ADDRESS.
    LeaPush,
    /// Fold constant ES loads into the memory operands that use them.
    SegmentFold,
    /// Fuse compares with the branches that test them.
    Conditional,
}

impl NormalizePass {
    /// Returns all passes in the order they run.
    pub fn all() -> &'static [NormalizePass] {
        use NormalizePass::*;
        &[
            Hooks,
            GotoCollapse,
            FarCall,
            Zeroing,
            WordPair,
            LeaPush,
            SegmentFold,
            Conditional,
        ]
    }

    /// Returns the name of the pass.
    pub fn name(&self) -> &'static str {
        use NormalizePass::*;
        match self {
            Hooks => "hooks",
            GotoCollapse => "goto-collapse",
            FarCall => "far-call",
            Zeroing => "zeroing",
            WordPair => "word-pair",
            LeaPush => "lea-push",
            SegmentFold => "segment-fold",
            Conditional => "conditional",
        }
    }

    /// Returns a description of the pass.
    pub fn description(&self) -> &'static str {
        use NormalizePass::*;
        match self {
            Hooks => "Remove calls to known no-op and source-name hooks",
            GotoCollapse => "Collapse chained and redundant jumps",
            FarCall => "Reconstruct absolute and far call targets",
            Zeroing => "Rewrite register self-xor/self-sub as mov 0",
            WordPair => "Fuse two word pushes popped into a dword register",
            LeaPush => "Fuse lea/push into push-address",
            SegmentFold => "Fold constant ES loads into memory operands",
            Conditional => "Fuse compares and conditional branches into IF forms",
        }
    }

    /// Parses a pass name.
    pub fn from_name(name: &str) -> Option<Self> {
        use NormalizePass::*;
        match name.to_lowercase().replace('_', "-").as_str() {
            "hooks" => Some(Hooks),
            "goto-collapse" | "goto" => Some(GotoCollapse),
            "far-call" => Some(FarCall),
            "zeroing" => Some(Zeroing),
            "word-pair" => Some(WordPair),
            "lea-push" => Some(LeaPush),
            "segment-fold" => Some(SegmentFold),
            "conditional" => Some(Conditional),
            _ => None,
        }
    }
}

/// Which normalization passes run.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    disabled: HashSet<NormalizePass>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self::all()
    }
}

impl NormalizerConfig {
    /// Every pass enabled.
    pub fn all() -> Self {
        Self {
            disabled: HashSet::new(),
        }
    }

    /// No pass enabled.
    pub fn none() -> Self {
        Self {
            disabled: NormalizePass::all().iter().copied().collect(),
        }
    }

    pub fn enable_pass(mut self, pass: NormalizePass) -> Self {
        self.disabled.remove(&pass);
        self
    }

    pub fn disable_pass(mut self, pass: NormalizePass) -> Self {
        self.disabled.insert(pass);
        self
    }

    pub fn is_pass_enabled(&self, pass: NormalizePass) -> bool {
        !self.disabled.contains(&pass)
    }

    /// Returns all enabled passes in the order they should be applied.
    pub fn enabled_passes(&self) -> Vec<NormalizePass> {
        NormalizePass::all()
            .iter()
            .copied()
            .filter(|&p| self.is_pass_enabled(p))
            .collect()
    }
}

/// What a known hook does when called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Does nothing useful; the call and its argument setup are dropped.
    Nop,
    /// Receives a pointer to the source-file name string.
    SourceName,
}

/// A routine recognized by its fixed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KnownHook {
    pub target: SegOff,
    pub kind: HookKind,
}

impl KnownHook {
    pub fn new(target: SegOff, kind: HookKind) -> Self {
        Self { target, kind }
    }
}

/// Configuration for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Decoder options.
    pub decoder: DecoderOptions,
    /// Normalization passes.
    pub normalizer: NormalizerConfig,
    /// Require frame teardown before every return of a framed function.
    pub strict_frames: bool,
    /// Instructions inspected backwards from an indirect jump.
    pub switch_window: usize,
    /// Known hooks, matched by linear call target.
    pub hooks: Vec<KnownHook>,
    /// Segment DS is assumed to address.
    pub data_segment: Option<SegmentId>,
    /// Segment whose single-jump stubs are followed to their targets.
    pub thunk_segment: Option<SegmentId>,
    /// Shortest library module considered by the matcher.
    pub min_library_length: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderOptions::default(),
            normalizer: NormalizerConfig::default(),
            strict_frames: true,
            switch_window: 8,
            hooks: Vec::new(),
            data_segment: None,
            thunk_segment: Some(SegmentId::resident(0)),
            min_library_length: 4,
        }
    }
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoder_options(mut self, options: DecoderOptions) -> Self {
        self.decoder = options;
        self
    }

    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_strict_frames(mut self, strict: bool) -> Self {
        self.strict_frames = strict;
        self
    }

    pub fn with_switch_window(mut self, window: usize) -> Self {
        self.switch_window = window.max(2);
        self
    }

    pub fn with_hook(mut self, hook: KnownHook) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_data_segment(mut self, segment: SegmentId) -> Self {
        self.data_segment = Some(segment);
        self
    }

    pub fn with_thunk_segment(mut self, segment: Option<SegmentId>) -> Self {
        self.thunk_segment = segment;
        self
    }

    /// Returns the hook called by a transfer to `target`, if any.
    pub fn hook_at(&self, target: SegOff) -> Option<&KnownHook> {
        self.hooks
            .iter()
            .find(|hook| hook.target.linear() == target.linear())
    }
}
