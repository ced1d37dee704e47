//! Graphviz output for call graphs and function flow.
//!
//! Call-graph nodes are grouped into one cluster per segment, overlays
//! included, and edges are drawn by how control reaches the callee. A
//! function's flow graph has one node per block; SWITCH edges carry their
//! case values.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use crate::{ControlFlow, Function, FunctionId, Instruction, Operand, SegmentId};

/// Escape special characters for DOT format strings.
///
/// # Example
/// ```
/// use dosrec_core::output::escape_dot_string;
/// assert_eq!(escape_dot_string("call \"_exit\""), "call \\\"_exit\\\"");
/// ```
pub fn escape_dot_string(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('<', "\\<")
        .replace('>', "\\>")
}

/// Configuration for DOT output generation.
#[derive(Debug, Clone)]
pub struct DotConfig {
    pub font_name: String,
    pub font_size: u32,
    /// Graph direction: "TB" (top-bottom), "LR" (left-right), etc.
    pub rankdir: String,
    /// Group call-graph nodes by segment.
    pub cluster_segments: bool,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            font_name: "Courier".to_string(),
            font_size: 10,
            rankdir: "LR".to_string(),
            cluster_segments: true,
        }
    }
}

impl DotConfig {
    fn open(&self, out: &mut String, name: &str, rankdir: &str) {
        let _ = writeln!(out, "digraph \"{}\" {{", escape_dot_string(name));
        let _ = writeln!(out, "    rankdir={};", rankdir);
        let _ = writeln!(
            out,
            "    node [shape=box, fontname=\"{}\", fontsize={}];",
            self.font_name, self.font_size
        );
        let _ = writeln!(
            out,
            "    edge [fontname=\"{}\", fontsize={}];",
            self.font_name, self.font_size
        );
    }
}

/// How a call-graph edge is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeStyle {
    Near,
    Far,
    Overlay,
    /// Control leaves the caller for good.
    Jump,
}

impl EdgeStyle {
    fn attributes(self) -> &'static str {
        match self {
            Self::Near => "",
            Self::Far => " [style=bold]",
            Self::Overlay => " [style=dashed, color=blue, label=\"ovl\"]",
            Self::Jump => " [style=dotted]",
        }
    }
}

/// Collects functions and calls, then renders them as one digraph.
#[derive(Debug)]
pub struct CallGraphDot<'a> {
    config: &'a DotConfig,
    clusters: BTreeMap<SegmentId, Vec<String>>,
    edges: Vec<String>,
}

impl<'a> CallGraphDot<'a> {
    pub fn new(config: &'a DotConfig) -> Self {
        Self {
            config,
            clusters: BTreeMap::new(),
            edges: Vec::new(),
        }
    }

    /// Adds a node for `function`. Library routines are shaded.
    pub fn function(&mut self, function: &Function) {
        let label = format!(
            "{}\\n{}:{:04X}",
            escape_dot_string(&function.display_name()),
            function.segment,
            function.entry
        );
        let shading = if function.is_library() {
            ", style=filled, fillcolor=lightgray"
        } else {
            ""
        };
        self.clusters.entry(function.segment).or_default().push(format!(
            "\"{}\" [label=\"{}\"{}];",
            node_id(function.id),
            label,
            shading
        ));
    }

    pub fn edge(&mut self, caller: FunctionId, callee: FunctionId, style: EdgeStyle) {
        self.edges.push(format!(
            "    \"{}\" -> \"{}\"{};",
            node_id(caller),
            node_id(callee),
            style.attributes()
        ));
    }

    pub fn finish(self) -> String {
        let mut out = String::new();
        self.config.open(&mut out, "callgraph", &self.config.rankdir);
        for (segment, nodes) in &self.clusters {
            if self.config.cluster_segments {
                let _ = writeln!(
                    out,
                    "    subgraph \"cluster_{}_{:04X}\" {{",
                    segment.overlay, segment.segment
                );
                let _ = writeln!(out, "        label=\"{}\";", segment);
                for node in nodes {
                    let _ = writeln!(out, "        {}", node);
                }
                out.push_str("    }\n");
            } else {
                for node in nodes {
                    let _ = writeln!(out, "    {}", node);
                }
            }
        }
        for edge in &self.edges {
            out.push_str(edge);
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }
}

fn node_id(id: FunctionId) -> String {
    format!("f{}", id.0)
}

/// Renders the control flow of one function. Blocks start at the entry,
/// at branch targets and after every transfer of control.
pub fn function_flow(function: &Function, config: &DotConfig) -> String {
    let blocks = split_blocks(&function.instructions);
    let starts: BTreeSet<u16> = blocks.iter().map(|b| b[0].offset()).collect();

    let mut out = String::new();
    config.open(&mut out, &function.display_name(), "TB");
    for block in &blocks {
        let mut label = String::new();
        for inst in *block {
            let line = format!("{:04X}  {}", inst.offset(), inst);
            label.push_str(&escape_dot_string(&line));
            label.push_str("\\l");
        }
        let _ = writeln!(out, "    \"b{:04X}\" [label=\"{}\"];", block[0].offset(), label);
    }

    for block in &blocks {
        let Some(last) = block.last() else {
            continue;
        };
        let from = block[0].offset();
        let mut edge = |to: u16, attributes: String| {
            if starts.contains(&to) {
                let _ = writeln!(out, "    \"b{:04X}\" -> \"b{:04X}\"{};", from, to, attributes);
            }
        };
        match last.control_flow() {
            ControlFlow::Jump { target } => edge(target, String::new()),
            ControlFlow::ConditionalBranch {
                target,
                fallthrough,
            } => {
                edge(target, " [label=\"taken\"]".to_string());
                edge(fallthrough, " [style=dashed]".to_string());
            }
            ControlFlow::Switch { .. } => {
                for op in &last.operands {
                    match op {
                        Operand::Case { value, target } => {
                            edge(*target, format!(" [label=\"case {}\"]", value))
                        }
                        Operand::Default { target } => {
                            edge(*target, " [label=\"default\", style=dashed]".to_string())
                        }
                        _ => {}
                    }
                }
            }
            _ if last.falls_through() => edge(last.end_offset(), String::new()),
            _ => {}
        }
    }
    out.push_str("}\n");
    out
}

fn split_blocks(instructions: &[Instruction]) -> Vec<&[Instruction]> {
    let targets: BTreeSet<u16> = instructions
        .iter()
        .flat_map(Instruction::branch_targets)
        .collect();
    let mut blocks = Vec::new();
    let mut start = 0;
    for i in 1..=instructions.len() {
        let transfers = !matches!(
            instructions[i - 1].control_flow(),
            ControlFlow::Sequential | ControlFlow::Call { .. } | ControlFlow::IndirectCall { .. }
        );
        let ends = i == instructions.len()
            || transfers
            || instructions[i].is_label
            || targets.contains(&instructions[i].offset())
            || instructions[i - 1].end_offset() != instructions[i].offset();
        if ends {
            blocks.push(&instructions[start..i]);
            start = i;
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FunctionKind, Mnemonic, Register, SegOff};

    fn ret(offset: u16) -> Instruction {
        Instruction::new(SegOff::new(0x0100, offset), 1, Mnemonic::Ret)
    }

    fn function(id: u32, segment: SegmentId, instructions: Vec<Instruction>) -> Function {
        let mut function = Function::new(FunctionId(id), id, segment, 0);
        function.instructions = instructions;
        function
    }

    #[test]
    fn test_escape_dot_string() {
        assert_eq!(escape_dot_string("a<b>"), "a\\<b\\>");
        assert_eq!(escape_dot_string("c:\\dos"), "c:\\\\dos");
    }

    #[test]
    fn test_call_graph_clusters_segments() {
        let config = DotConfig::default();
        let main = function(0, SegmentId::resident(0x1000), vec![ret(0)]);
        let mut strlen = function(1, SegmentId::new(2, 0x0000), Vec::new());
        strlen.name = Some("_strlen".to_string());
        strlen.kind = FunctionKind::Library {
            module: "STRLEN".to_string(),
        };

        let mut dot = CallGraphDot::new(&config);
        dot.function(&main);
        dot.function(&strlen);
        dot.edge(main.id, strlen.id, EdgeStyle::Overlay);
        let out = dot.finish();

        assert!(out.starts_with("digraph \"callgraph\" {"));
        assert!(out.contains("subgraph \"cluster_0_1000\""));
        assert!(out.contains("subgraph \"cluster_2_0000\""));
        assert!(out.contains("label=\"_strlen\\n"));
        assert!(out.contains("fillcolor=lightgray"));
        assert!(out.contains("\"f0\" -> \"f1\" [style=dashed, color=blue, label=\"ovl\"];"));
        assert!(out.ends_with("}\n"));
    }

    #[test]
    fn test_flat_call_graph() {
        let config = DotConfig {
            cluster_segments: false,
            ..DotConfig::default()
        };
        let mut dot = CallGraphDot::new(&config);
        dot.function(&function(0, SegmentId::resident(0), vec![ret(0)]));
        dot.edge(FunctionId(0), FunctionId(0), EdgeStyle::Near);
        let out = dot.finish();
        assert!(!out.contains("subgraph"));
        assert!(out.contains("    \"f0\" -> \"f0\";\n"));
    }

    #[test]
    fn test_switch_edges_carry_cases() {
        let switch = Instruction::new(SegOff::new(0x0100, 0), 5, Mnemonic::Switch).with_operands(vec![
            Operand::reg(Register::AX),
            Operand::Case { value: 3, target: 5 },
            Operand::Case { value: 4, target: 6 },
            Operand::Default { target: 7 },
        ]);
        let body = vec![switch, ret(5), ret(6), ret(7)];
        let out = function_flow(&function(0, SegmentId::resident(0x0100), body), &DotConfig::default());

        assert_eq!(out.matches("\\l\"];").count(), 4);
        assert!(out.contains("\"b0000\" -> \"b0005\" [label=\"case 3\"];"));
        assert!(out.contains("\"b0000\" -> \"b0006\" [label=\"case 4\"];"));
        assert!(out.contains("\"b0000\" -> \"b0007\" [label=\"default\", style=dashed];"));
    }

    #[test]
    fn test_conditional_branch_blocks() {
        let jz = Instruction::new(SegOff::new(0x0100, 0), 2, Mnemonic::Jcc(crate::Condition::Equal))
            .with_operand(Operand::relative(1, 3));
        let body = vec![jz, ret(2), ret(3)];
        let out = function_flow(&function(0, SegmentId::resident(0x0100), body), &DotConfig::default());
        assert!(out.contains("\"b0000\" -> \"b0003\" [label=\"taken\"];"));
        assert!(out.contains("\"b0000\" -> \"b0002\" [style=dashed];"));
        assert!(!out.contains("\"b0002\" ->"));
    }
}
