//! Grammar extraction from execution trees.
//!
//! The tree is walked breadth-first and every node contributes one
//! alternative to the nonterminal named by its label:
//!
//! * a call node contributes the labels of its children,
//! * a terminal bucket contributes one alternative per value it may take
//!   (one character, or one token nonterminal), or epsilon if it is empty,
//! * a loop node `<L>` becomes `<L> ::= <L_cont> <L> | <L_exit>`, where the
//!   body of its last iteration is an alternative of `<L_exit>` and the
//!   bodies of all other iterations are alternatives of `<L_cont>`.
//!
//! Iteration nodes only group the children of one iteration and get no rule
//! of their own. After all traces are extracted, [`fix_loops`] removes the
//! continue part of loops that never iterated.

use std::collections::VecDeque;
use std::sync::OnceLock;

use log::{debug, warn};
use regex::Regex;

use crate::error::{Error, Result};
use crate::exec_tree::{ExecNode, NodeKind};
use crate::grammar::{Grammar, Rule, START};
use crate::symbol::Symbol;

/// What the values in terminal buckets stand for.
#[derive(Debug, Copy, Clone)]
pub enum TerminalMode<'a> {
    /// Byte values, turned into single-character terminals.
    Bytes,
    /// Token ids, turned into references to `<TOK_id>` of this token grammar.
    Tokens(&'a Grammar),
}

/// Buckets with at least this many token ids mean "any token".
pub const UNCONSTRAINED_TOKEN_COUNT: usize = 255;

/// Name of the continue part of loop `nt`: `<f@0_L0>` -> `<f@0_L0_cont>`.
pub fn continue_name(nt: &str) -> String {
    format!("{}_cont>", &nt[..nt.len() - 1])
}

/// Name of the exit part of loop `nt`: `<f@0_L0>` -> `<f@0_L0_exit>`.
pub fn exit_name(nt: &str) -> String {
    format!("{}_exit>", &nt[..nt.len() - 1])
}

/// Does `nt` name a loop node?
pub fn is_loop_label(nt: &str) -> bool {
    static LOOP: OnceLock<Regex> = OnceLock::new();
    LOOP.get_or_init(|| Regex::new(r"^<.+@\d+_L\d+>$").expect("static regex"))
        .is_match(nt)
}

/// Adds the rules of `root` to `grammar`.
///
/// All traces of a subject must start in the same root frame; a root that
/// disagrees with an existing `<start>` rule is an error.
pub fn extract_into(grammar: &mut Grammar, root: &ExecNode, mode: TerminalMode<'_>) -> Result<()> {
    let start_rule: Rule = vec![Symbol::nonterminal(root.label.clone())];
    match grammar.get(START) {
        Some(existing) if *existing != vec![start_rule.clone()] => {
            let expected = existing
                .iter()
                .map(|rule| rule.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(" "))
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(Error::StartMismatch {
                expected,
                found: root.label.clone(),
            });
        }
        Some(_) => {}
        None => {
            grammar.insert(START, vec![start_rule]);
        }
    }

    let mut queue = VecDeque::from([root]);
    while let Some(node) = queue.pop_front() {
        match &node.kind {
            NodeKind::Bucket(values) => add_bucket(grammar, &node.label, values, mode)?,
            NodeKind::Loop => add_loop(grammar, node),
            NodeKind::Call => {
                let rule: Rule = node.children.iter().map(|c| Symbol::nonterminal(c.label.clone())).collect();
                grammar.add_alternative(&node.label, rule);
            }
            NodeKind::Iteration => {}
        }
        queue.extend(node.children.iter());
    }
    Ok(())
}

fn add_bucket(grammar: &mut Grammar, nt: &str, values: &[u32], mode: TerminalMode<'_>) -> Result<()> {
    grammar.entry(nt);
    if values.is_empty() {
        grammar.add_alternative(nt, Vec::new());
        return Ok(());
    }
    match mode {
        TerminalMode::Bytes => {
            for &value in values {
                let byte = u8::try_from(value).map_err(|_| Error::SolutionOutOfRange(value))?;
                grammar.add_alternative(nt, vec![Symbol::terminal(char::from(byte).to_string())]);
            }
        }
        TerminalMode::Tokens(tokens) if values.len() >= UNCONSTRAINED_TOKEN_COUNT => {
            for token in tokens.nonterminals().filter(|t| t.starts_with("<TOK_")) {
                grammar.add_alternative(nt, vec![Symbol::nonterminal(token.clone())]);
            }
        }
        TerminalMode::Tokens(tokens) => {
            for value in values {
                let token = format!("<TOK_{}>", value);
                if !tokens.contains(&token) {
                    return Err(Error::UnknownToken(token));
                }
                grammar.add_alternative(nt, vec![Symbol::nonterminal(token)]);
            }
        }
    }
    Ok(())
}

fn add_loop(grammar: &mut Grammar, node: &ExecNode) {
    let nt = &node.label;
    let cont = continue_name(nt);
    let exit = exit_name(nt);
    grammar.insert(
        nt.clone(),
        vec![
            vec![Symbol::nonterminal(cont.clone()), Symbol::nonterminal(nt.clone())],
            vec![Symbol::nonterminal(exit.clone())],
        ],
    );
    grammar.entry(&cont);
    grammar.entry(&exit);
    let last = node.children.len().saturating_sub(1);
    for (i, iteration) in node.children.iter().enumerate() {
        let body: Rule = iteration
            .children
            .iter()
            .map(|c| Symbol::nonterminal(c.label.clone()))
            .collect();
        let target = if i == last { &exit } else { &cont };
        grammar.add_alternative(target, body);
    }
}

/// Collapses loops without continue iterations to their exit part.
///
/// Returns the loops that were collapsed.
pub fn fix_loops(grammar: &mut Grammar) -> Vec<String> {
    let loops: Vec<String> = grammar.nonterminals().filter(|nt| is_loop_label(nt)).cloned().collect();
    let mut collapsed = Vec::new();
    for nt in loops {
        let cont = continue_name(&nt);
        let exit = exit_name(&nt);
        if grammar.get(&cont).is_some_and(Vec::is_empty) {
            warn!("no continue iterations in {}, the loop only exits", cont);
            grammar.remove(&cont);
            grammar.insert(nt.clone(), vec![vec![Symbol::nonterminal(exit)]]);
            collapsed.push(nt);
        } else {
            debug!("loop {} keeps {} continue alternatives", nt, grammar.alternatives(&cont).len());
        }
    }
    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grammar::from_literal;
    use crate::symbol::rule;
    use test_log::test;

    fn node(label: &str, kind: NodeKind, children: Vec<ExecNode>) -> ExecNode {
        ExecNode {
            label: label.to_string(),
            kind,
            children,
        }
    }

    fn bucket(label: &str, values: &[u32]) -> ExecNode {
        node(label, NodeKind::Bucket(values.to_vec()), vec![])
    }

    #[test]
    fn test_digits_bucket() {
        let digits: Vec<u32> = (b'0'..=b'9').map(u32::from).collect();
        let root = node("<main@0>", NodeKind::Call, vec![bucket("<__T1>", &digits)]);
        let mut g = Grammar::new();
        extract_into(&mut g, &root, TerminalMode::Bytes).unwrap();
        assert_eq!(g.alternatives(START), &[rule(["<main@0>"])]);
        assert_eq!(g.alternatives("<__T1>").len(), 10);
        assert_eq!(g.alternatives("<__T1>")[0], rule(["0"]));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_loop_encoding() {
        // Iterations 1, 2, 3 with bodies [A], [A, B], [A, B].
        let iteration = |count: u64, labels: &[&str]| {
            node(
                &format!("<f@0_L0:I{}>", count),
                NodeKind::Iteration,
                labels.iter().map(|l| bucket(l, &[97])).collect(),
            )
        };
        let lp = node(
            "<f@0_L0>",
            NodeKind::Loop,
            vec![iteration(1, &["<A>"]), iteration(2, &["<A>", "<B>"]), iteration(3, &["<A>", "<B>"])],
        );
        let root = node("<f@0>", NodeKind::Call, vec![lp]);
        let mut g = Grammar::new();
        extract_into(&mut g, &root, TerminalMode::Bytes).unwrap();
        assert_eq!(g.alternatives("<f@0_L0>"), &[rule(["<f@0_L0_cont>", "<f@0_L0>"]), rule(["<f@0_L0_exit>"])]);
        assert_eq!(g.alternatives("<f@0_L0_exit>"), &[rule(["<A>", "<B>"])]);
        assert_eq!(g.alternatives("<f@0_L0_cont>"), &[rule(["<A>"]), rule(["<A>", "<B>"])]);
        assert!(!g.contains("<f@0_L0:I1>"));
        assert!(fix_loops(&mut g).is_empty());
    }

    #[test]
    fn test_fix_loops_collapses_single_iteration() {
        let lp = node(
            "<f@0_L0>",
            NodeKind::Loop,
            vec![node("<f@0_L0:I1>", NodeKind::Iteration, vec![bucket("<__T1>", &[97])])],
        );
        let root = node("<f@0>", NodeKind::Call, vec![lp]);
        let mut g = Grammar::new();
        extract_into(&mut g, &root, TerminalMode::Bytes).unwrap();
        assert_eq!(fix_loops(&mut g), vec!["<f@0_L0>".to_string()]);
        assert_eq!(g.alternatives("<f@0_L0>"), &[rule(["<f@0_L0_exit>"])]);
        assert!(!g.contains("<f@0_L0_cont>"));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_empty_bucket_is_epsilon_once() {
        let root = node("<m@0>", NodeKind::Call, vec![bucket("<__T1>", &[]), bucket("<__T1>", &[])]);
        let mut g = Grammar::new();
        extract_into(&mut g, &root, TerminalMode::Bytes).unwrap();
        assert_eq!(g.alternatives("<__T1>"), &[Vec::<Symbol>::new()]);
    }

    #[test]
    fn test_start_mismatch() {
        let mut g = Grammar::new();
        extract_into(&mut g, &node("<a@0>", NodeKind::Call, vec![bucket("<__T1>", &[97])]), TerminalMode::Bytes).unwrap();
        let other = node("<b@0>", NodeKind::Call, vec![bucket("<__T1>", &[97])]);
        assert!(matches!(
            extract_into(&mut g, &other, TerminalMode::Bytes),
            Err(Error::StartMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range_value() {
        let root = node("<m@0>", NodeKind::Call, vec![bucket("<__T1>", &[300])]);
        let mut g = Grammar::new();
        assert!(matches!(
            extract_into(&mut g, &root, TerminalMode::Bytes),
            Err(Error::SolutionOutOfRange(300))
        ));
    }

    #[test]
    fn test_token_mode() {
        let tokens = from_literal(&[("<TOK_1>", &[&["if"]]), ("<TOK_2>", &[&["x"]]), ("<__external_1>", &[&["if"]])]);
        let root = node("<m@0>", NodeKind::Call, vec![bucket("<__T1>", &[2])]);
        let mut g = Grammar::new();
        extract_into(&mut g, &root, TerminalMode::Tokens(&tokens)).unwrap();
        assert_eq!(g.alternatives("<__T1>"), &[rule(["<TOK_2>"])]);

        let any: Vec<u32> = (0..255).collect();
        let root = node("<m@0>", NodeKind::Call, vec![bucket("<__T2>", &any)]);
        extract_into(&mut g, &root, TerminalMode::Tokens(&tokens)).unwrap();
        assert_eq!(g.alternatives("<__T2>"), &[rule(["<TOK_1>"]), rule(["<TOK_2>"])]);

        let root = node("<m@0>", NodeKind::Call, vec![bucket("<__T3>", &[7])]);
        assert!(matches!(
            extract_into(&mut g, &root, TerminalMode::Tokens(&tokens)),
            Err(Error::UnknownToken(t)) if t == "<TOK_7>"
        ));
    }

    #[test]
    fn test_loop_names() {
        assert!(is_loop_label("<f@0_L0>"));
        assert!(is_loop_label("<json_parse@12_L3>"));
        assert!(!is_loop_label("<f@0_L0:I1>"));
        assert!(!is_loop_label("<f@0>"));
        assert_eq!(continue_name("<f@0_L0>"), "<f@0_L0_cont>");
        assert_eq!(exit_name("<f@0_L0>"), "<f@0_L0_exit>");
    }
}
