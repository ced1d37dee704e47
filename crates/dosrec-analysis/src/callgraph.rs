//! Call graph between recovered functions.
//!
//! Edges are recorded by the resolver as it binds call and jump targets,
//! so the graph covers exactly the functions reachable from the entry
//! points.

use std::collections::{BTreeMap, HashSet};

use dosrec_core::output::{CallGraphDot, DotConfig, EdgeStyle};
use dosrec_core::FunctionId;

use crate::program::Program;

/// How control reaches the callee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CallKind {
    /// Near call within the caller's segment.
    Near,
    /// Far call to a resident segment.
    Far,
    /// Call through the overlay manager.
    Overlay,
    /// Jump leaving the caller (tail call or far jump).
    Jump,
}

impl CallKind {
    fn edge_style(self) -> EdgeStyle {
        match self {
            Self::Near => EdgeStyle::Near,
            Self::Far => EdgeStyle::Far,
            Self::Overlay => EdgeStyle::Overlay,
            Self::Jump => EdgeStyle::Jump,
        }
    }
}

/// An edge in the call graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CallSite {
    pub caller: FunctionId,
    /// Offset of the transferring instruction in the caller's segment.
    pub offset: u16,
    pub kind: CallKind,
}

/// Caller/callee relationships keyed by function id.
#[derive(Debug, Default)]
pub struct CallGraph {
    outgoing: BTreeMap<FunctionId, Vec<(FunctionId, CallSite)>>,
    incoming: BTreeMap<FunctionId, Vec<(FunctionId, CallSite)>>,
    /// Indirect calls: (caller, offset).
    unresolved: Vec<(FunctionId, u16)>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a call edge from `site.caller` to `callee`.
    pub fn add_call(&mut self, callee: FunctionId, site: CallSite) {
        self.outgoing
            .entry(site.caller)
            .or_default()
            .push((callee, site));
        self.incoming
            .entry(callee)
            .or_default()
            .push((site.caller, site));
    }

    /// Record a call whose target is computed at run time.
    pub fn add_unresolved_call(&mut self, caller: FunctionId, offset: u16) {
        self.unresolved.push((caller, offset));
    }

    /// Functions called by `caller`, in discovery order.
    pub fn callees(&self, caller: FunctionId) -> impl Iterator<Item = (FunctionId, &CallSite)> {
        self.outgoing
            .get(&caller)
            .into_iter()
            .flat_map(|v| v.iter().map(|(id, site)| (*id, site)))
    }

    /// Functions calling `callee`.
    pub fn callers(&self, callee: FunctionId) -> impl Iterator<Item = (FunctionId, &CallSite)> {
        self.incoming
            .get(&callee)
            .into_iter()
            .flat_map(|v| v.iter().map(|(id, site)| (*id, site)))
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.values().map(|v| v.len()).sum()
    }

    pub fn unresolved_calls(&self) -> &[(FunctionId, u16)] {
        &self.unresolved
    }

    /// Check if a function calls itself directly or indirectly.
    pub fn is_recursive(&self, id: FunctionId) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for (callee, _) in self.callees(current) {
                if callee == id {
                    return true;
                }
                stack.push(callee);
            }
        }
        false
    }

    /// All functions reachable from `entry`, itself included.
    pub fn reachable_from(&self, entry: FunctionId) -> HashSet<FunctionId> {
        let mut reachable = HashSet::new();
        let mut stack = vec![entry];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current) {
                continue;
            }
            stack.extend(self.callees(current).map(|(callee, _)| callee));
        }
        reachable
    }

    /// Renders the graph in DOT format, naming nodes after `program`'s
    /// functions. Parallel calls of one kind collapse into a single edge.
    pub fn to_dot(&self, program: &Program, config: &DotConfig) -> String {
        let mut dot = CallGraphDot::new(config);
        for function in program.functions() {
            dot.function(function);
        }
        for (caller, edges) in &self.outgoing {
            let mut seen = HashSet::new();
            for (callee, site) in edges {
                if seen.insert((*callee, site.kind)) {
                    dot.edge(*caller, *callee, site.kind.edge_style());
                }
            }
        }
        dot.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(caller: u32, offset: u16) -> CallSite {
        CallSite {
            caller: FunctionId(caller),
            offset,
            kind: CallKind::Near,
        }
    }

    #[test]
    fn test_edges_both_directions() {
        let mut graph = CallGraph::new();
        graph.add_call(FunctionId(1), site(0, 0x10));
        graph.add_call(FunctionId(2), site(0, 0x20));
        graph.add_call(FunctionId(2), site(1, 0x05));

        assert_eq!(graph.edge_count(), 3);
        let callees: Vec<_> = graph.callees(FunctionId(0)).map(|(id, _)| id).collect();
        assert_eq!(callees, vec![FunctionId(1), FunctionId(2)]);
        let callers: Vec<_> = graph.callers(FunctionId(2)).map(|(id, _)| id).collect();
        assert_eq!(callers, vec![FunctionId(0), FunctionId(1)]);
        assert_eq!(graph.reachable_from(FunctionId(1)).len(), 2);
    }

    #[test]
    fn test_recursion() {
        let mut graph = CallGraph::new();
        graph.add_call(FunctionId(1), site(0, 0));
        graph.add_call(FunctionId(0), site(1, 0));
        graph.add_call(FunctionId(3), site(2, 0));
        assert!(graph.is_recursive(FunctionId(0)));
        assert!(!graph.is_recursive(FunctionId(2)));
    }
}
