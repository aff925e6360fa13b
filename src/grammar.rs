//! Context-free grammars.
//!
//! A [`Grammar`] maps nonterminal names (`<name>`) to an ordered list of
//! alternatives, each alternative being a sequence of [`Symbol`]s. Insertion
//! order of nonterminals is preserved, so a grammar written to disk reads in
//! the order it was built.
//!
//! # File format
//!
//! Grammars are stored as a JSON object from nonterminal name to a list of
//! alternatives, each alternative a list of symbol strings:
//!
//! ```
//! use grammar_miner::grammar::Grammar;
//!
//! let g = Grammar::from_json_str(r#"{"<start>": [["<x>"]], "<x>": [["a"], ["b"]]}"#).unwrap();
//! assert_eq!(g.alternatives("<x>").len(), 2);
//! assert!(g.validate().is_ok());
//! ```
//!
//! # Invariants
//!
//! Grammars handed to consumers satisfy [`Grammar::validate`]: `<start>` is
//! defined, every nonterminal reachable from it is defined, and no
//! nonterminal lists the same alternative twice.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::symbol::Symbol;

/// The designated start symbol.
pub const START: &str = "<start>";

/// One alternative of a nonterminal.
pub type Rule = Vec<Symbol>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grammar {
    rules: IndexMap<String, Vec<Rule>>,
}

impl Grammar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn contains(&self, nt: &str) -> bool {
        self.rules.contains_key(nt)
    }

    pub fn get(&self, nt: &str) -> Option<&Vec<Rule>> {
        self.rules.get(nt)
    }

    pub fn get_mut(&mut self, nt: &str) -> Option<&mut Vec<Rule>> {
        self.rules.get_mut(nt)
    }

    /// Alternatives of `nt`, or an empty slice if `nt` is undefined.
    pub fn alternatives(&self, nt: &str) -> &[Rule] {
        self.rules.get(nt).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Defines (or redefines) `nt`, returning the previous alternatives.
    pub fn insert(&mut self, nt: impl Into<String>, alternatives: Vec<Rule>) -> Option<Vec<Rule>> {
        self.rules.insert(nt.into(), alternatives)
    }

    /// Removes `nt`, keeping the order of the remaining nonterminals.
    pub fn remove(&mut self, nt: &str) -> Option<Vec<Rule>> {
        self.rules.shift_remove(nt)
    }

    /// Alternatives of `nt`, creating an empty entry if needed.
    pub fn entry(&mut self, nt: &str) -> &mut Vec<Rule> {
        if !self.rules.contains_key(nt) {
            self.rules.insert(nt.to_string(), Vec::new());
        }
        &mut self.rules[nt]
    }

    /// Appends `rule` to `nt` unless it is already present.
    ///
    /// Returns `true` if the rule was added.
    pub fn add_alternative(&mut self, nt: &str, rule: Rule) -> bool {
        let alternatives = self.entry(nt);
        if alternatives.contains(&rule) {
            false
        } else {
            alternatives.push(rule);
            true
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Rule>)> {
        self.rules.iter()
    }

    pub fn nonterminals(&self) -> impl Iterator<Item = &String> {
        self.rules.keys()
    }

    /// Overlays `update` onto this grammar: nonterminals defined in `update`
    /// replace existing definitions, new ones are appended.
    pub fn merge(&mut self, update: Grammar) {
        for (nt, alternatives) in update.rules {
            self.rules.insert(nt, alternatives);
        }
    }

    /// Returns a copy of this grammar with `update` merged in.
    pub fn merged_with(&self, update: &Grammar) -> Grammar {
        let mut g = self.clone();
        g.merge(update.clone());
        g
    }

    /// Defined nonterminals reachable from `start` (including `start`), in
    /// discovery order.
    pub fn reachable_from(&self, start: &str) -> IndexSet<String> {
        let mut reachable = IndexSet::new();
        if !self.contains(start) {
            return reachable;
        }
        reachable.insert(start.to_string());
        let mut i = 0;
        while i < reachable.len() {
            let nt = reachable[i].clone();
            for rule in self.alternatives(&nt) {
                for symbol in rule {
                    if let Symbol::Nonterminal(name) = symbol {
                        if self.contains(name) && !reachable.contains(name) {
                            reachable.insert(name.clone());
                        }
                    }
                }
            }
            i += 1;
        }
        reachable
    }

    /// Removes every nonterminal not reachable from `start`.
    ///
    /// Returns the removed names.
    pub fn prune_unreachable(&mut self, start: &str) -> Vec<String> {
        let reachable = self.reachable_from(start);
        let unreachable: Vec<String> = self.rules.keys().filter(|nt| !reachable.contains(*nt)).cloned().collect();
        for nt in &unreachable {
            debug!("pruning unreachable nonterminal {}", nt);
            self.rules.shift_remove(nt);
        }
        unreachable
    }

    /// Nonterminals referenced anywhere but never defined.
    pub fn undefined_nonterminals(&self) -> BTreeSet<String> {
        self.rules
            .values()
            .flatten()
            .flatten()
            .filter_map(Symbol::nonterminal_name)
            .filter(|name| !self.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// Undefined nonterminals referenced from the part of the grammar
    /// reachable from `start`.
    pub fn dangling_from(&self, start: &str) -> BTreeSet<String> {
        self.reachable_from(start)
            .iter()
            .flat_map(|nt| self.alternatives(nt))
            .flatten()
            .filter_map(Symbol::nonterminal_name)
            .filter(|name| !self.contains(name))
            .map(str::to_string)
            .collect()
    }

    /// Checks the well-formedness invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.contains(START) {
            return Err(Error::MissingStart);
        }
        let dangling = self.dangling_from(START);
        if !dangling.is_empty() {
            return Err(Error::DanglingNonterminals(dangling.into_iter().collect()));
        }
        for (nt, alternatives) in &self.rules {
            let unique: HashSet<&Rule> = alternatives.iter().collect();
            if unique.len() != alternatives.len() {
                return Err(Error::DuplicateAlternative(nt.clone()));
            }
        }
        Ok(())
    }

    /// Replaces every reference to `from` by a reference to `to`.
    pub fn replace_references(&mut self, from: &str, to: &str) {
        for alternatives in self.rules.values_mut() {
            for rule in alternatives.iter_mut() {
                for symbol in rule.iter_mut() {
                    if matches!(symbol, Symbol::Nonterminal(name) if name == from) {
                        *symbol = Symbol::Nonterminal(to.to_string());
                    }
                }
            }
        }
    }

    /// Renames `from` to `to`, both its definition and all references.
    pub fn rename(&mut self, from: &str, to: &str) {
        if let Some(index) = self.rules.get_index_of(from) {
            if let Some((_, alternatives)) = self.rules.shift_remove_index(index) {
                self.rules.shift_insert(index, to.to_string(), alternatives);
            }
        }
        self.replace_references(from, to);
    }

    /// One deduplication pass: nonterminals whose alternative lists are
    /// identical are collapsed onto the first one defined, and references
    /// are rewritten. `<start>` is never merged.
    ///
    /// Returns `true` if anything changed.
    pub fn dedup_once(&mut self) -> bool {
        let mut seen: HashMap<&Vec<Rule>, &String> = HashMap::new();
        let mut collapse = Vec::new();
        for (nt, alternatives) in &self.rules {
            if nt == START {
                continue;
            }
            match seen.get(alternatives) {
                Some(&kept) => collapse.push((nt.clone(), kept.clone())),
                None => {
                    seen.insert(alternatives, nt);
                }
            }
        }
        for (duplicate, kept) in &collapse {
            debug!("dedup: {} == {}", duplicate, kept);
            self.rules.shift_remove(duplicate);
            self.replace_references(duplicate, kept);
        }
        if !collapse.is_empty() {
            // Rewritten references can make two alternatives equal.
            for alternatives in self.rules.values_mut() {
                let mut unique = HashSet::new();
                alternatives.retain(|rule| unique.insert(rule.clone()));
            }
        }
        !collapse.is_empty()
    }

    /// Deduplicates until a fixed point is reached.
    pub fn dedup(&mut self) {
        while self.dedup_once() {}
    }

    /// All characters occurring in terminals reachable from `nt`.
    pub fn terminal_alphabet(&self, nt: &str) -> BTreeSet<char> {
        self.reachable_from(nt)
            .iter()
            .flat_map(|n| self.alternatives(n))
            .flatten()
            .filter(|s| s.is_terminal())
            .flat_map(|s| s.as_str().chars())
            .collect()
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&text)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?).map_err(|e| Error::io(path, e))?;
        debug!("wrote grammar to {}", path.display());
        Ok(())
    }
}

impl FromIterator<(String, Vec<Rule>)> for Grammar {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Rule>)>>(iter: I) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}

/// Compares two alternative lists ignoring order.
pub fn same_alternatives(a: &[Rule], b: &[Rule]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

/// BNF-style listing, nonterminals in reachability order from `<start>`,
/// followed by unreachable ones.
impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reachable = self.reachable_from(START);
        let order = reachable.iter().chain(self.rules.keys().filter(|nt| !reachable.contains(*nt)));
        for nt in order {
            writeln!(f, "{} ::=", nt)?;
            for rule in self.alternatives(nt) {
                let body: Vec<String> = rule.iter().map(|s| s.to_string()).collect();
                if body.is_empty() {
                    writeln!(f, "    | \"\"")?;
                } else {
                    writeln!(f, "    | {}", body.join(" "))?;
                }
            }
        }
        let undefined = self.undefined_nonterminals();
        if !undefined.is_empty() {
            writeln!(f, "undefined: {}", undefined.into_iter().collect::<Vec<_>>().join(", "))?;
        }
        Ok(())
    }
}

/// Builds a grammar from `(nonterminal, [[symbol, ...], ...])` literals.
///
/// ```
/// use grammar_miner::grammar;
///
/// let g = grammar::from_literal(&[("<start>", &[&["<x>"]]), ("<x>", &[&["a"], &["b"]])]);
/// assert_eq!(g.len(), 2);
/// ```
pub fn from_literal(definitions: &[(&str, &[&[&str]])]) -> Grammar {
    definitions
        .iter()
        .map(|(nt, alternatives)| {
            let rules = alternatives
                .iter()
                .map(|rule| rule.iter().map(|s| Symbol::from(*s)).collect())
                .collect();
            (nt.to_string(), rules)
        })
        .collect()
}
