//! Arena-allocated derivation trees.
//!
//! Parse trees and generated derivations live in a [`TreeArena`] and are
//! addressed by lightweight [`NodeId`] handles. Nodes are immutable once
//! allocated: [`TreeArena::splice`] replaces a subtree by copying only the
//! nodes on the path from the root to the replaced node, so every earlier
//! tree rooted in the same arena stays valid and shares its unchanged
//! subtrees with the new one.

use std::fmt;

use crate::symbol::Symbol;

/// Handle to a node in a [`TreeArena`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Node {
    symbol: Symbol,
    children: Vec<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct TreeArena {
    nodes: Vec<Node>,
}

impl TreeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alloc(&mut self, symbol: Symbol, children: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { symbol, children });
        id
    }

    /// Allocates a terminal leaf.
    pub fn leaf(&mut self, text: impl Into<String>) -> NodeId {
        self.alloc(Symbol::Terminal(text.into()), Vec::new())
    }

    pub fn symbol(&self, id: NodeId) -> &Symbol {
        &self.nodes[id.index()].symbol
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].children
    }

    /// The rule applied at `id`: the symbols of its children.
    pub fn rule_at(&self, id: NodeId) -> Vec<Symbol> {
        self.children(id).iter().map(|&c| self.symbol(c).clone()).collect()
    }

    /// Follows `path` (child indices) from `root`.
    pub fn node_at(&self, root: NodeId, path: &[usize]) -> Option<NodeId> {
        let mut current = root;
        for &i in path {
            current = *self.children(current).get(i)?;
        }
        Some(current)
    }

    /// The string derived by the subtree at `id`.
    pub fn yield_string(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_yield(id, &mut out);
        out
    }

    fn write_yield(&self, id: NodeId, out: &mut String) {
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let n = &self.nodes[node.index()];
            match &n.symbol {
                Symbol::Terminal(text) => out.push_str(text),
                Symbol::Nonterminal(_) => stack.extend(n.children.iter().rev()),
            }
        }
    }

    /// Returns a new root whose tree equals `root` with the node at `path`
    /// replaced by `replacement`. Only the nodes along `path` are copied.
    ///
    /// # Panics
    ///
    /// Panics if `path` does not address a node under `root`.
    pub fn splice(&mut self, root: NodeId, path: &[usize], replacement: NodeId) -> NodeId {
        let mut spine = Vec::with_capacity(path.len());
        let mut current = root;
        for &i in path {
            spine.push(current);
            current = self.children(current)[i];
        }
        let mut new_child = replacement;
        for (&node, &i) in spine.iter().zip(path).rev() {
            let mut children = self.children(node).to_vec();
            children[i] = new_child;
            let symbol = self.symbol(node).clone();
            new_child = self.alloc(symbol, children);
        }
        new_child
    }

    /// Renders the subtree at `id` as an indented outline.
    pub fn outline(&self, id: NodeId) -> String {
        let mut out = String::new();
        let mut stack = vec![(id, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            for _ in 0..depth {
                out.push_str("  ");
            }
            out.push_str(&self.symbol(node).to_string());
            out.push('\n');
            for &c in self.children(node).iter().rev() {
                stack.push((c, depth + 1));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn sample(arena: &mut TreeArena) -> NodeId {
        // <s> -> <a> "+" <a>, <a> -> "1" | "2"
        let one = arena.leaf("1");
        let a1 = arena.alloc(Symbol::from("<a>"), vec![one]);
        let plus = arena.leaf("+");
        let two = arena.leaf("2");
        let a2 = arena.alloc(Symbol::from("<a>"), vec![two]);
        arena.alloc(Symbol::from("<s>"), vec![a1, plus, a2])
    }

    #[test]
    fn test_yield() {
        let mut arena = TreeArena::new();
        let root = sample(&mut arena);
        assert_eq!(arena.yield_string(root), "1+2");
        assert_eq!(arena.rule_at(root), crate::symbol::rule(["<a>", "+", "<a>"]));
    }

    #[test]
    fn test_splice_is_copy_on_write() {
        let mut arena = TreeArena::new();
        let root = sample(&mut arena);
        let nine = arena.leaf("9");
        let a9 = arena.alloc(Symbol::from("<a>"), vec![nine]);
        let before = arena.len();
        let spliced = arena.splice(root, &[2], a9);
        // Only the root is copied.
        assert_eq!(arena.len(), before + 1);
        assert_eq!(arena.yield_string(spliced), "1+9");
        assert_eq!(arena.yield_string(root), "1+2");
        assert_eq!(arena.children(spliced)[0], arena.children(root)[0]);
    }

    #[test]
    fn test_splice_empty_path() {
        let mut arena = TreeArena::new();
        let root = sample(&mut arena);
        let x = arena.leaf("x");
        assert_eq!(arena.splice(root, &[], x), x);
    }

    #[test]
    fn test_node_at() {
        let mut arena = TreeArena::new();
        let root = sample(&mut arena);
        let two = arena.node_at(root, &[2, 0]).unwrap();
        assert_eq!(arena.symbol(two), &Symbol::from("2"));
        assert!(arena.node_at(root, &[5]).is_none());
    }
}
