//! DOT rendering of an assembled task graph.
//!
//! Nodes and edges are snapshotted while the graph is built, so a
//! description can be generated before, during, or after execution.

use super::GraphState;
use crate::{types::TaskId, utils::shorten};
use core::fmt::Write;

/// Omit memory acquisition/release edges from the output.
pub const DOTGEN_FLAG_HIDE_MEMORY_EDGES: u32 = 1 << 0;
/// Label data edges with the record type flowing across them.
pub const DOTGEN_FLAG_SHOW_IN_OUT_TYPES: u32 = 1 << 1;
/// Render each data connector as an explicit queue node.
pub const DOTGEN_FLAG_SHOW_CONNECTORS: u32 = 1 << 2;

#[derive(Debug, Clone, Default)]
pub(crate) struct DotModel {
    pub(crate) nodes: Vec<DotNode>,
    pub(crate) edges: Vec<DotEdge>,
}

#[derive(Debug, Clone)]
pub(crate) struct DotNode {
    pub(crate) id: TaskId,
    pub(crate) name: String,
    pub(crate) threads: usize,
    pub(crate) color: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DotEndpoint {
    Task(TaskId),
    GraphInput,
    GraphOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DotEdgeKind {
    Data,
    Rule(String),
    MemoryAcquire,
    MemoryRelease,
}

#[derive(Debug, Clone)]
pub(crate) struct DotEdge {
    pub(crate) from: DotEndpoint,
    pub(crate) to: DotEndpoint,
    pub(crate) type_name: &'static str,
    pub(crate) kind: DotEdgeKind,
}

fn endpoint(end: DotEndpoint) -> String {
    match end {
        DotEndpoint::Task(id) => format!("t{}", id.get()),
        DotEndpoint::GraphInput => "graph_input".to_string(),
        DotEndpoint::GraphOutput => "graph_output".to_string(),
    }
}

pub(crate) fn render(state: &GraphState, flags: u32) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph g{} {{", state.graph_id.0);
    let _ = writeln!(out, "  node [shape=box, style=filled];");

    let uses_input = state
        .dot
        .edges
        .iter()
        .any(|edge| edge.from == DotEndpoint::GraphInput);
    let uses_output = state
        .dot
        .edges
        .iter()
        .any(|edge| edge.to == DotEndpoint::GraphOutput);
    if uses_input {
        let _ = writeln!(
            out,
            "  graph_input [label=\"input\", shape=invtriangle, fillcolor=\"gray\"];"
        );
    }
    if uses_output {
        let _ = writeln!(
            out,
            "  graph_output [label=\"output\", shape=triangle, fillcolor=\"gray\"];"
        );
    }

    for node in &state.dot.nodes {
        let mut label = node.name.clone();
        if node.threads > 1 {
            let _ = write!(label, "\\nx{}", node.threads);
        }
        let _ = writeln!(
            out,
            "  t{} [label=\"{}\", fillcolor=\"{}\"];",
            node.id.get(),
            label,
            node.color
        );
    }

    let mut queue_index = 0usize;
    for edge in &state.dot.edges {
        let memory_edge = matches!(
            edge.kind,
            DotEdgeKind::MemoryAcquire | DotEdgeKind::MemoryRelease
        );
        if memory_edge && flags & DOTGEN_FLAG_HIDE_MEMORY_EDGES != 0 {
            continue;
        }
        let mut attrs = Vec::new();
        match &edge.kind {
            DotEdgeKind::Data => {
                if flags & DOTGEN_FLAG_SHOW_IN_OUT_TYPES != 0 {
                    attrs.push(format!("label=\"{}\"", shorten(edge.type_name)));
                }
            }
            DotEdgeKind::Rule(rule) => {
                attrs.push(format!("label=\"{rule}\""));
            }
            DotEdgeKind::MemoryAcquire => {
                attrs.push("label=\"acquire\"".to_string());
                attrs.push("style=dashed".to_string());
            }
            DotEdgeKind::MemoryRelease => {
                attrs.push("label=\"release\"".to_string());
                attrs.push("style=dashed".to_string());
            }
        }
        let attrs = if attrs.is_empty() {
            String::new()
        } else {
            format!(" [{}]", attrs.join(", "))
        };
        if !memory_edge && flags & DOTGEN_FLAG_SHOW_CONNECTORS != 0 {
            let queue = format!("q{queue_index}");
            queue_index += 1;
            let _ = writeln!(
                out,
                "  {queue} [label=\"{}\", shape=oval, fillcolor=\"white\"];",
                shorten(edge.type_name)
            );
            let _ = writeln!(out, "  {} -> {queue}{attrs};", endpoint(edge.from));
            let _ = writeln!(out, "  {queue} -> {}{attrs};", endpoint(edge.to));
        } else {
            let _ = writeln!(
                out,
                "  {} -> {}{attrs};",
                endpoint(edge.from),
                endpoint(edge.to)
            );
        }
    }

    out.push_str("}\n");
    out
}
