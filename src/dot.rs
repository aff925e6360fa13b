//! Execution trees and parse trees to DOT (Graphviz).
//!
//! Rendering an execution tree is the quickest way to see why the miner
//! produced a particular rule: every call, loop and iteration node becomes a
//! box, every terminal bucket an ellipse labeled with the characters it holds.
//! Parse trees from [`EarleyParser`][crate::parser::EarleyParser] are drawn
//! the same way, which makes counterexamples easy to inspect.
//!
//! ```
//! use grammar_miner::dot::DotConfig;
//! use grammar_miner::grammar::from_literal;
//! use grammar_miner::parser::{EarleyParser, ParseOutcome};
//! use grammar_miner::deadline::Deadline;
//! use grammar_miner::tree::TreeArena;
//!
//! let g = from_literal(&[("<start>", &[&["<d>", "<d>"]]), ("<d>", &[&["1"], &["2"]])]);
//! let mut arena = TreeArena::new();
//! let ParseOutcome::Tree(root) = EarleyParser::new(&g).parse(&mut arena, "12", &Deadline::never()) else {
//!     panic!("no parse");
//! };
//! let dot = grammar_miner::dot::parse_tree_to_dot(&arena, root, &DotConfig::default()).unwrap();
//! // Render with: dot -Tpng tree.dot -o tree.png
//! assert!(dot.starts_with("digraph {"));
//! ```

use std::fmt::{self, Write as _};

use crate::exec_tree::{ExecNode, NodeKind};
use crate::tree::{NodeId, TreeArena};

/// Visual settings of the generated graph.
#[derive(Debug, Clone)]
pub struct DotConfig {
    /// Shape of call, loop and iteration nodes (default: "box")
    pub node_shape: &'static str,
    /// Shape of buckets and terminal leaves (default: "ellipse")
    pub terminal_shape: &'static str,
    /// Style of edges into loop and iteration nodes (default: "dashed")
    pub loop_edge_style: &'static str,
    /// Buckets with more values are abbreviated (default: 16)
    pub max_bucket_chars: usize,
}

impl Default for DotConfig {
    fn default() -> Self {
        Self {
            node_shape: "box",
            terminal_shape: "ellipse",
            loop_edge_style: "dashed",
            max_bucket_chars: 16,
        }
    }
}

/// Escapes `s` for a double-quoted DOT label.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c if c.is_control() => {
                let _ = write!(out, "\\\\x{:02x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

fn bucket_label(values: &[u32], max: usize) -> String {
    let shown: String = values.iter().take(max).filter_map(|&v| char::from_u32(v)).collect();
    if values.len() > max {
        format!("{}… ({} values)", shown, values.len())
    } else {
        shown
    }
}

/// Renders an execution tree.
pub fn exec_tree_to_dot(root: &ExecNode, config: &DotConfig) -> Result<String, fmt::Error> {
    let mut dot = String::new();
    writeln!(dot, "digraph {{")?;
    writeln!(dot, "node [shape={}];", config.node_shape)?;
    let mut next_id = 0;
    write_exec_node(&mut dot, root, &mut next_id, config)?;
    writeln!(dot, "}}")?;
    Ok(dot)
}

fn write_exec_node(dot: &mut String, node: &ExecNode, next_id: &mut usize, config: &DotConfig) -> Result<usize, fmt::Error> {
    let id = *next_id;
    *next_id += 1;
    match &node.kind {
        NodeKind::Bucket(values) => writeln!(
            dot,
            "n{} [shape={}, label=\"{}\\n{}\"];",
            id,
            config.terminal_shape,
            escape(&node.label),
            escape(&bucket_label(values, config.max_bucket_chars))
        )?,
        _ => writeln!(dot, "n{} [label=\"{}\"];", id, escape(&node.label))?,
    }
    for child in &node.children {
        let child_id = write_exec_node(dot, child, next_id, config)?;
        match child.kind {
            NodeKind::Loop | NodeKind::Iteration => {
                writeln!(dot, "n{} -> n{} [style={}];", id, child_id, config.loop_edge_style)?
            }
            _ => writeln!(dot, "n{} -> n{};", id, child_id)?,
        }
    }
    Ok(id)
}

/// Renders the parse tree below `root`.
///
/// Nodes are named after their arena indices, so subtrees shared by
/// spliced trees appear once.
pub fn parse_tree_to_dot(arena: &TreeArena, root: NodeId, config: &DotConfig) -> Result<String, fmt::Error> {
    let mut dot = String::new();
    writeln!(dot, "digraph {{")?;
    writeln!(dot, "node [shape={}];", config.node_shape)?;
    let mut seen = vec![false; arena.len()];
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if std::mem::replace(&mut seen[id.index()], true) {
            continue;
        }
        let symbol = arena.symbol(id);
        if symbol.is_nonterminal() {
            writeln!(dot, "n{} [label=\"{}\"];", id.index(), escape(symbol.as_str()))?;
        } else {
            writeln!(
                dot,
                "n{} [shape={}, label=\"{}\"];",
                id.index(),
                config.terminal_shape,
                escape(&format!("{:?}", symbol.as_str()))
            )?;
        }
        for &child in arena.children(id) {
            writeln!(dot, "n{} -> n{};", id.index(), child.index())?;
            stack.push(child);
        }
    }
    writeln!(dot, "}}")?;
    Ok(dot)
}
