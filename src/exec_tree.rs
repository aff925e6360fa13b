//! Execution trees.
//!
//! Every ordered input position contributes one root-to-leaf path: the call
//! stack of its read, with loop and iteration nodes interleaved, ending in a
//! terminal bucket that holds the values the position may take. Paths are
//! merged into the tree only along its rightmost spine, so that consecutive
//! positions read by the same frame end up under one node while a repeated
//! call later in the input gets a node of its own.
//!
//! Labels are made stable across traces by a [`LabelState`], which assigns
//! small ids to call contexts, loop headers and terminal buckets. Reusing one
//! state for all traces of a subject is what lets the extractor merge them
//! into a single grammar.

use std::collections::HashMap;

use indexmap::IndexMap;
use log::{trace, warn};

use crate::config::ContextMode;
use crate::order::OrderedTrace;
use crate::trace::ExecutionContext;

/// How a label was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathElement {
    /// `callee@ctx`
    Call { callee: String, ctx: usize },
    /// `callee@ctx_L<loop>`
    Loop { callee: String, ctx: usize, id: usize },
    /// `callee@ctx_L<loop>:I<count>`
    Iteration {
        callee: String,
        ctx: usize,
        id: usize,
        count: u64,
    },
}

impl PathElement {
    /// Nonterminal name of this element.
    pub fn label(&self) -> String {
        match self {
            PathElement::Call { callee, ctx } => format!("<{}@{}>", callee, ctx),
            PathElement::Loop { callee, ctx, id } => format!("<{}@{}_L{}>", callee, ctx, id),
            PathElement::Iteration { callee, ctx, id, count } => format!("<{}@{}_L{}:I{}>", callee, ctx, id, count),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            PathElement::Call { .. } => NodeKind::Call,
            PathElement::Loop { .. } => NodeKind::Loop,
            PathElement::Iteration { .. } => NodeKind::Iteration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Call,
    Loop,
    Iteration,
    /// Leaf: the sorted values one input position may take.
    Bucket(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecNode {
    pub label: String,
    pub kind: NodeKind,
    pub children: Vec<ExecNode>,
}

impl ExecNode {
    fn new(label: String, kind: NodeKind) -> Self {
        Self {
            label,
            kind,
            children: Vec::new(),
        }
    }

    /// Labels of the children: the grammar rule this node stands for.
    pub fn child_labels(&self) -> Vec<String> {
        self.children.iter().map(|c| c.label.clone()).collect()
    }

    /// Total number of nodes in this subtree.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(ExecNode::size).sum::<usize>()
    }
}

/// Id allocators shared by all traces of one mining run.
#[derive(Debug, Clone, Default)]
pub struct LabelState {
    /// `(callee, context key)` to its per-callee index.
    contexts: HashMap<(String, String), usize>,
    context_counters: HashMap<String, usize>,
    /// Per callee: loop header to loop id, in first-seen order.
    loops: HashMap<String, IndexMap<String, usize>>,
    /// Sorted solution set to bucket id, ids starting at 1.
    buckets: HashMap<Vec<u32>, usize>,
}

impl LabelState {
    pub fn new() -> Self {
        Self::default()
    }

    fn context_id(&mut self, callee: &str, key: String) -> usize {
        let next = self.context_counters.entry(callee.to_string()).or_insert(0);
        *self.contexts.entry((callee.to_string(), key)).or_insert_with(|| {
            let id = *next;
            *next += 1;
            id
        })
    }

    fn loop_id(&mut self, callee: &str, header: &str) -> usize {
        let loops = self.loops.entry(callee.to_string()).or_default();
        let next = loops.len();
        *loops.entry(header.to_string()).or_insert(next)
    }

    fn bucket_id(&mut self, solutions: &[u32]) -> usize {
        let next = self.buckets.len() + 1;
        *self.buckets.entry(solutions.to_vec()).or_insert(next)
    }

    /// The label path of one call stack.
    pub fn path(&mut self, context: &ExecutionContext, mode: ContextMode) -> Vec<PathElement> {
        let mut path = Vec::new();
        let mut callsites: Vec<&str> = Vec::with_capacity(context.len());
        for frame in context {
            callsites.push(&frame.callsite);
            let key = match mode {
                ContextMode::None => String::new(),
                ContextMode::Caller => frame.callsite.clone(),
                ContextMode::CallPath => callsites.join(","),
                ContextMode::Window(k) => callsites[callsites.len().saturating_sub(k)..].join(","),
            };
            let ctx = self.context_id(&frame.callee, key);
            path.push(PathElement::Call {
                callee: frame.callee.clone(),
                ctx,
            });
            for iteration in &frame.loopiterations {
                let id = self.loop_id(&frame.callee, &iteration.loopheader);
                path.push(PathElement::Loop {
                    callee: frame.callee.clone(),
                    ctx,
                    id,
                });
                path.push(PathElement::Iteration {
                    callee: frame.callee.clone(),
                    ctx,
                    id,
                    count: iteration.iterationcount,
                });
            }
        }
        path
    }

    /// The leaf for a solution set. Byte-mode buckets never contain 0.
    pub fn bucket(&mut self, solutions: &[u32], keep_null: bool) -> ExecNode {
        let mut values: Vec<u32> = solutions.iter().copied().filter(|&v| keep_null || v != 0).collect();
        values.sort_unstable();
        values.dedup();
        let id = self.bucket_id(&values);
        ExecNode::new(format!("<__T{}>", id), NodeKind::Bucket(values))
    }
}

/// Inserts `path` below `siblings`, reusing the rightmost sibling at every
/// level where its label matches.
fn insert_path(siblings: &mut Vec<ExecNode>, path: &[PathElement], leaf: ExecNode) {
    let Some((head, rest)) = path.split_first() else {
        siblings.push(leaf);
        return;
    };
    let label = head.label();
    match siblings.last_mut() {
        Some(last) if last.label == label => insert_path(&mut last.children, rest, leaf),
        _ => {
            let mut node = ExecNode::new(label, head.kind());
            insert_path(&mut node.children, rest, leaf);
            siblings.push(node);
        }
    }
}

/// Builds the execution tree of one ordered trace.
///
/// `keep_null` is set for token-cursor subjects, whose buckets hold token
/// ids rather than bytes. Returns `None` if the trace has no positions.
pub fn build_tree(
    trace: &OrderedTrace,
    state: &mut LabelState,
    mode: ContextMode,
    keep_null: bool,
) -> Option<ExecNode> {
    let mut roots = Vec::new();
    for position in &trace.positions {
        let path = state.path(&position.context, mode);
        let leaf = state.bucket(&position.solutions, keep_null);
        trace!(
            "inserting {} -> {}",
            path.iter().map(PathElement::label).collect::<Vec<_>>().join(" "),
            leaf.label
        );
        insert_path(&mut roots, &path, leaf);
    }
    if roots.len() > 1 {
        warn!("trace has {} top-level frames, keeping the first", roots.len());
    }
    roots.into_iter().next()
}
