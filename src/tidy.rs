//! Grammar Tidier.
//!
//! Two rewrites that shrink a mined grammar without changing its language:
//!
//! - nonterminals with a single alternative are inlined into every rule that
//!   mentions them,
//! - two alternatives that differ by one inserted nonterminal `X` are merged
//!   into the longer one with `X` replaced by `<opt_X> ::= "" | X`.
//!
//! Each can enable the other, so [`tidy`] alternates them until neither
//! applies. Pattern roots are never inlined: they keep the token structure
//! readable and are what later optional factoring keys on.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::grammar::{Grammar, Rule};
use crate::patterns::is_pattern_root;
use crate::symbol::{bare_name, Symbol};

/// Runs inlining and optional factoring to a fixed point.
pub fn tidy(grammar: &mut Grammar) {
    let before = grammar.len();
    loop {
        let mut changed = false;
        while inline_single_rules(grammar) {
            changed = true;
        }
        if factor_optionals(grammar) {
            changed = true;
        }
        if !changed {
            break;
        }
    }
    debug!("tidied grammar: {} -> {} nonterminals", before, grammar.len());
}

/// One inlining pass. Returns `true` if any reference was replaced.
///
/// Definitions are looked up in the grammar as it was before the pass, so a
/// chain of single-alternative nonterminals shrinks by one link per pass.
/// Self-referencing single rules are left alone.
pub fn inline_single_rules(grammar: &mut Grammar) -> bool {
    let inlineable: HashMap<String, Rule> = grammar
        .iter()
        .filter(|(nt, alternatives)| {
            alternatives.len() == 1
                && !is_pattern_root(nt)
                && !alternatives[0].iter().any(|s| s.nonterminal_name() == Some(nt.as_str()))
        })
        .map(|(nt, alternatives)| (nt.clone(), alternatives[0].clone()))
        .collect();
    if inlineable.is_empty() {
        return false;
    }

    let mut changed = false;
    let keys: Vec<String> = grammar.nonterminals().cloned().collect();
    for key in keys {
        if is_pattern_root(&key) {
            continue;
        }
        let alternatives = grammar.entry(&key);
        let mut rewritten: Vec<Rule> = Vec::with_capacity(alternatives.len());
        for rule in alternatives.iter() {
            let mut new_rule = Vec::with_capacity(rule.len());
            for symbol in rule {
                match symbol.nonterminal_name().and_then(|name| inlineable.get(name)) {
                    Some(body) => {
                        new_rule.extend(body.iter().cloned());
                        changed = true;
                    }
                    _ => new_rule.push(symbol.clone()),
                }
            }
            if !rewritten.contains(&new_rule) {
                rewritten.push(new_rule);
            }
        }
        *alternatives = rewritten;
    }
    changed
}

/// Index at which `long` is `short` with one symbol inserted.
fn insertion_point(short: &[Symbol], long: &[Symbol]) -> Option<usize> {
    if long.len() != short.len() + 1 {
        return None;
    }
    (0..=short.len()).find(|&k| long[..k] == short[..k] && long[k + 1..] == short[k..])
}

/// Finds the first pair of alternatives that differ by one optional
/// nonterminal: `(shorter index, longer index, insertion point)`.
fn find_optional(alternatives: &[Rule]) -> Option<(usize, usize, usize)> {
    for i in 0..alternatives.len() {
        for j in i + 1..alternatives.len() {
            let (short, long) = if alternatives[i].len() < alternatives[j].len() {
                (i, j)
            } else {
                (j, i)
            };
            let Some(k) = insertion_point(&alternatives[short], &alternatives[long]) else {
                continue;
            };
            match alternatives[long][k].nonterminal_name() {
                Some(name) if !name.starts_with("<opt_") => return Some((short, long, k)),
                _ => continue,
            }
        }
    }
    None
}

/// `<opt_X>`, or a numbered variant if that name is taken by something else.
fn optional_name(grammar: &Grammar, optional: &str, definition: &[Rule]) -> String {
    let base = format!("opt_{}", bare_name(optional));
    let free = |name: &String| grammar.get(name).map_or(true, |existing| existing.as_slice() == definition);
    let plain = format!("<{}>", base);
    if free(&plain) {
        return plain;
    }
    (1..)
        .map(|n| format!("<{}_{}>", base, n))
        .find(free)
        .unwrap_or(plain)
}

/// One optional-factoring pass over every nonterminal.
///
/// Returns `true` if any pair was merged.
pub fn factor_optionals(grammar: &mut Grammar) -> bool {
    let mut changed = false;
    let keys: Vec<String> = grammar.nonterminals().cloned().collect();
    for key in keys {
        while let Some((short, long, k)) = find_optional(grammar.alternatives(&key)) {
            let optional = grammar.alternatives(&key)[long][k].as_str().to_string();
            let definition = vec![vec![Symbol::epsilon()], vec![Symbol::nonterminal(optional.clone())]];
            let opt = optional_name(grammar, &optional, &definition);
            debug!("{}: {} is optional", key, optional);
            grammar.insert(opt.clone(), definition);

            let alternatives = grammar.entry(&key);
            alternatives[long][k] = Symbol::nonterminal(opt);
            alternatives.remove(short);
            let mut seen = HashSet::new();
            alternatives.retain(|rule| seen.insert(rule.clone()));
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::deadline::Deadline;
    use crate::grammar::{from_literal, START};
    use crate::parser::{EarleyParser, Recognition};
    use crate::symbol::rule;
    use test_log::test;

    fn accepts(g: &Grammar, input: &str) -> bool {
        EarleyParser::new(g).recognize(input, &Deadline::never()) == Recognition::Accepted
    }

    #[test]
    fn test_inline_chain() {
        let mut g = from_literal(&[
            ("<start>", &[&["<a>", "z"]]),
            ("<a>", &[&["<b>", "y"]]),
            ("<b>", &[&["x"]]),
        ]);
        tidy(&mut g);
        g.prune_unreachable(START);
        assert_eq!(g.alternatives(START), &[rule(["x", "y", "z"])]);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_pattern_roots_survive() {
        let mut g = from_literal(&[
            ("<start>", &[&["<digits>"]]),
            ("<digits>", &[&["<digit>"]]),
            ("<digit>", &[&["0"], &["1"]]),
        ]);
        tidy(&mut g);
        assert_eq!(g.alternatives(START), &[rule(["<digits>"])]);
        assert_eq!(g.alternatives("<digits>"), &[rule(["<digit>"])]);
    }

    #[test]
    fn test_self_reference_not_inlined() {
        let mut g = from_literal(&[("<start>", &[&["<a>"], &["q"]]), ("<a>", &[&["x", "<a>"]])]);
        assert!(!inline_single_rules(&mut g));
    }

    #[test]
    fn test_inlining_dedups_alternatives() {
        let mut g = from_literal(&[("<start>", &[&["<a>"], &["<b>"]]), ("<a>", &[&["x"]]), ("<b>", &[&["x"]])]);
        inline_single_rules(&mut g);
        assert_eq!(g.alternatives(START), &[rule(["x"])]);
    }

    #[test]
    fn test_opt_factoring() {
        let mut g = from_literal(&[
            ("<start>", &[&["x", "<b>", "y"], &["x", "y"], &["w"]]),
            ("<b>", &[&["b"], &["bb"]]),
        ]);
        assert!(factor_optionals(&mut g));
        assert_eq!(g.alternatives(START), &[rule(["x", "<opt_b>", "y"]), rule(["w"])]);
        assert_eq!(g.alternatives("<opt_b>"), &[rule([""]), rule(["<b>"])]);
        assert!(!factor_optionals(&mut g));
    }

    #[test]
    fn test_opt_name_clash() {
        let mut g = from_literal(&[
            ("<start>", &[&["<sign>", "1"], &["1"]]),
            ("<sign>", &[&["-"]]),
            ("<opt_sign>", &[&[""], &["+"], &["-"]]),
        ]);
        assert!(factor_optionals(&mut g));
        assert_eq!(g.alternatives(START), &[rule(["<opt_sign_1>", "1"])]);
        assert_eq!(g.alternatives("<opt_sign>").len(), 3);
    }

    #[test]
    fn test_opt_factoring_skips_terminals_and_opts() {
        let mut g = from_literal(&[("<start>", &[&["x", "y"], &["x"]])]);
        assert!(!factor_optionals(&mut g));
        let mut g = from_literal(&[
            ("<start>", &[&["x", "<opt_b>"], &["x"]]),
            ("<opt_b>", &[&[""], &["b"]]),
        ]);
        assert!(!factor_optionals(&mut g));
    }

    #[test]
    fn test_tidy_preserves_language() {
        let original = from_literal(&[
            ("<start>", &[&["<sign>", "<num>"], &["<num>"]]),
            ("<sign>", &[&["-"], &["+"]]),
            ("<num>", &[&["<d>", "<num>"], &["<d>"]]),
            ("<d>", &[&["<d0>"], &["1"]]),
            ("<d0>", &[&["0"]]),
        ]);
        let mut tidied = original.clone();
        tidy(&mut tidied);
        tidied.prune_unreachable(START);
        assert!(tidied.contains("<opt_sign>"));
        for input in ["1", "-10", "+0", "01", "--1", "", "+", "2"] {
            assert_eq!(accepts(&original, input), accepts(&tidied, input), "{input:?}");
        }
        assert!(tidied.validate().is_ok());
    }
}
