//! Limited-depth random derivation.
//!
//! The generator expands nonterminals uniformly at random until the derivation
//! reaches `max_depth`; below that depth it only picks among the cheapest
//! alternatives, so every derivation terminates. The cost of an alternative is
//! one more than the most expensive nonterminal it mentions, computed once per
//! grammar as a fixed point. Alternatives that can never finish (their cost is
//! infinite) are never chosen.
//!
//! ```
//! use grammar_miner::deadline::Deadline;
//! use grammar_miner::generator::Generator;
//! use grammar_miner::grammar;
//!
//! let g = grammar::from_literal(&[("<start>", &[&["<d>"], &["<d>", "<start>"]]), ("<d>", &[&["0"], &["1"]])]);
//! let mut generator = Generator::new(&g, 5, 42);
//! let s = generator.generate_string("<start>", &Deadline::never()).unwrap();
//! assert!(!s.is_empty() && s.chars().all(|c| c == '0' || c == '1'));
//! ```

use std::collections::HashMap;

use log::trace;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::deadline::{Checkpoint, Deadline};
use crate::error::{Error, Result};
use crate::grammar::{Grammar, Rule};
use crate::symbol::Symbol;
use crate::tree::{NodeId, TreeArena};

/// Cost of deriving an alternative; `None` if it never terminates.
type Cost = Option<usize>;

pub struct Generator<'g> {
    grammar: &'g Grammar,
    max_depth: usize,
    costs: HashMap<&'g str, Vec<Cost>>,
    rng: ChaCha8Rng,
}

impl<'g> Generator<'g> {
    pub fn new(grammar: &'g Grammar, max_depth: usize, seed: u64) -> Self {
        Self {
            grammar,
            max_depth,
            costs: rule_costs(grammar),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn grammar(&self) -> &'g Grammar {
        self.grammar
    }

    /// Minimal derivation cost of `nt`, `None` if `nt` is unproductive or undefined.
    pub fn cost(&self, nt: &str) -> Cost {
        self.costs.get(nt).and_then(|costs| costs.iter().flatten().min().copied())
    }

    /// Derives a random tree rooted at `start`.
    pub fn generate(&mut self, arena: &mut TreeArena, start: &str, deadline: &Deadline) -> Result<NodeId> {
        let mut checkpoint = Checkpoint::new(deadline, 256);
        self.expand(arena, start, None, 0, &mut checkpoint)
    }

    /// Derives a random tree rooted at `start` whose root uses alternative
    /// `first_choice`.
    pub fn generate_with_first_choice(
        &mut self,
        arena: &mut TreeArena,
        start: &str,
        first_choice: usize,
        deadline: &Deadline,
    ) -> Result<NodeId> {
        let mut checkpoint = Checkpoint::new(deadline, 256);
        self.expand(arena, start, Some(first_choice), 0, &mut checkpoint)
    }

    /// Derives a random string from `start`.
    pub fn generate_string(&mut self, start: &str, deadline: &Deadline) -> Result<String> {
        let mut arena = TreeArena::new();
        let root = self.generate(&mut arena, start, deadline)?;
        Ok(arena.yield_string(root))
    }

    fn expand(
        &mut self,
        arena: &mut TreeArena,
        nt: &str,
        forced: Option<usize>,
        depth: usize,
        checkpoint: &mut Checkpoint<'_>,
    ) -> Result<NodeId> {
        if checkpoint.tick() {
            return Err(Error::Interrupted);
        }
        let grammar = self.grammar;
        let alternatives = grammar.get(nt).ok_or_else(|| Error::UndefinedNonterminal(nt.to_string()))?;
        let index = match forced {
            Some(index) => {
                if index >= alternatives.len() || self.costs[nt][index].is_none() {
                    return Err(Error::Unproductive(nt.to_string()));
                }
                index
            }
            None => self.choose(nt, depth)?,
        };
        trace!("{}{} -> alternative {}", " ".repeat(depth), nt, index);
        let children = self.expand_rule(arena, &alternatives[index], depth + 1, checkpoint)?;
        Ok(arena.alloc(Symbol::Nonterminal(nt.to_string()), children))
    }

    fn expand_rule(
        &mut self,
        arena: &mut TreeArena,
        rule: &Rule,
        depth: usize,
        checkpoint: &mut Checkpoint<'_>,
    ) -> Result<Vec<NodeId>> {
        let mut children = Vec::with_capacity(rule.len());
        for symbol in rule {
            let child = match symbol {
                Symbol::Terminal(text) => arena.leaf(text.clone()),
                Symbol::Nonterminal(name) => self.expand(arena, name, None, depth, checkpoint)?,
            };
            children.push(child);
        }
        Ok(children)
    }

    fn choose(&mut self, nt: &str, depth: usize) -> Result<usize> {
        let costs = &self.costs[nt];
        let candidates: Vec<usize> = if depth >= self.max_depth {
            let min = costs.iter().flatten().min().copied();
            (0..costs.len()).filter(|&i| min.is_some() && costs[i] == min).collect()
        } else {
            (0..costs.len()).filter(|&i| costs[i].is_some()).collect()
        };
        candidates
            .choose(&mut self.rng)
            .copied()
            .ok_or_else(|| Error::Unproductive(nt.to_string()))
    }
}

/// Per-alternative costs as a fixed point over the grammar.
fn rule_costs(grammar: &Grammar) -> HashMap<&str, Vec<Cost>> {
    let mut costs: HashMap<&str, Vec<Cost>> = grammar
        .iter()
        .map(|(nt, alternatives)| (nt.as_str(), vec![None; alternatives.len()]))
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for (nt, alternatives) in grammar.iter() {
            for (i, rule) in alternatives.iter().enumerate() {
                let mut cost = Some(1);
                for name in rule.iter().filter_map(Symbol::nonterminal_name) {
                    let sub = costs.get(name).and_then(|c| c.iter().flatten().min().copied());
                    cost = match (cost, sub) {
                        (Some(c), Some(s)) => Some(c.max(s + 1)),
                        _ => None,
                    };
                }
                let Some(cost) = cost else { continue };
                if let Some(slot) = costs.get_mut(nt.as_str()).and_then(|c| c.get_mut(i)) {
                    if slot.map_or(true, |old| cost < old) {
                        *slot = Some(cost);
                        changed = true;
                    }
                }
            }
        }
    }
    costs
}

/// Generates `count` strings from `<start>`, skipping derivations that hit
/// `timeout`.
pub fn sample_strings(
    grammar: &Grammar,
    count: usize,
    max_depth: usize,
    seed: u64,
    timeout: std::time::Duration,
) -> Result<Vec<String>> {
    let mut generator = Generator::new(grammar, max_depth, seed);
    let mut out = Vec::with_capacity(count);
    let mut attempts = 0;
    while out.len() < count && attempts < count.saturating_mul(10).max(10) {
        attempts += 1;
        match generator.generate_string(crate::grammar::START, &Deadline::after(timeout)) {
            Ok(s) => out.push(s),
            Err(Error::Interrupted) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grammar::{from_literal, START};
    use test_log::test;

    #[test]
    fn test_costs() {
        let g = from_literal(&[
            ("<start>", &[&["<a>", "<start>"], &["<a>"]]),
            ("<a>", &[&["x"], &["<b>"]]),
            ("<b>", &[&["<b>"]]),
        ]);
        let generator = Generator::new(&g, 3, 0);
        assert_eq!(generator.cost("<a>"), Some(1));
        assert_eq!(generator.cost("<start>"), Some(2));
        assert_eq!(generator.cost("<b>"), None);
    }

    #[test]
    fn test_depth_bound_terminates() {
        let g = from_literal(&[("<start>", &[&["(", "<start>", ")"], &["x"]])]);
        let mut generator = Generator::new(&g, 4, 7);
        for _ in 0..50 {
            let s = generator.generate_string(START, &Deadline::never()).unwrap();
            assert_eq!(s.matches('x').count(), 1);
            assert!(s.len() <= 9, "{s}");
        }
    }

    #[test]
    fn test_forced_first_choice() {
        let g = from_literal(&[("<start>", &[&["a"], &["b"]])]);
        let mut generator = Generator::new(&g, 4, 0);
        let mut arena = TreeArena::new();
        for _ in 0..10 {
            let root = generator.generate_with_first_choice(&mut arena, START, 1, &Deadline::never()).unwrap();
            assert_eq!(arena.yield_string(root), "b");
        }
    }

    #[test]
    fn test_undefined_is_error() {
        let g = from_literal(&[("<start>", &[&["<nope>"]])]);
        let mut generator = Generator::new(&g, 4, 0);
        assert!(matches!(
            generator.generate_string(START, &Deadline::never()),
            Err(Error::Unproductive(_) | Error::UndefinedNonterminal(_))
        ));
    }

    #[test]
    fn test_unproductive_is_error() {
        let g = from_literal(&[("<start>", &[&["<start>"]])]);
        let mut generator = Generator::new(&g, 4, 0);
        assert!(matches!(generator.generate_string(START, &Deadline::never()), Err(Error::Unproductive(_))));
    }

    #[test]
    fn test_expired_deadline_interrupts() {
        let mut g = from_literal(&[("<x>", &[&["x"]])]);
        g.insert(START, vec![vec![Symbol::from("<x>"); 300]]);
        let mut generator = Generator::new(&g, 4, 0);
        let result = generator.generate_string(START, &Deadline::after(std::time::Duration::ZERO));
        assert!(matches!(result, Err(Error::Interrupted)));
        let result = generator.generate_string(START, &Deadline::never()).unwrap();
        assert_eq!(result.len(), 300);
    }

    #[test]
    fn test_seed_is_deterministic() {
        let g = from_literal(&[("<start>", &[&["a", "<start>"], &["b", "<start>"], &[""]])]);
        let a = sample_strings(&g, 20, 6, 99, std::time::Duration::from_secs(1)).unwrap();
        let b = sample_strings(&g, 20, 6, 99, std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(a, b);
    }
}
