//! Token generalization.
//!
//! Nonterminals of uninstrumented callees (`<__external_...>`) hold the raw
//! strings a lexer-like function was seen to consume. The [`Generalizer`]
//! samples each of them and replaces it by one of three things:
//!
//! 1. a literal enumeration behind optional leading whitespace, when many
//!    samples start with whitespace and only a few distinct strings remain
//!    after stripping it (keywords, punctuation),
//! 2. the unchanged enumeration, when there are only a few distinct samples,
//! 3. the first [`Pattern`] of the library that covers the samples,
//!    narrowed to the observed alphabet and optionally preceded by whitespace.
//!
//! Ids for narrowed patterns, whitespace sets and literal nonterminals are
//! allocated by the generalizer, so one generalizer must be used for all
//! tokens of a grammar to keep fresh names unique.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};

use crate::config::GeneralizeConfig;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::generator::Generator;
use crate::grammar::{Grammar, Rule};
use crate::patterns::{self, is_ws_or_control, Pattern};
use crate::symbol::Symbol;

/// Does `nt` name an uninstrumented callee whose strings get generalized?
pub fn is_external(nt: &str) -> bool {
    nt.starts_with("<__external_")
}

/// How a token was generalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generalization {
    /// Stripped literals behind optional whitespace, rooted at the given nonterminal.
    LiteralWithWs(String),
    /// Left as (or turned into) an enumeration of concrete strings.
    Literal,
    /// Replaced by the pattern rooted at the given nonterminal.
    Pattern(String),
}

/// Samples split into leading whitespace and the rest.
#[derive(Debug, Clone, Default)]
pub struct Stripped {
    /// Characters seen in any whitespace prefix.
    pub ws_alphabet: BTreeSet<char>,
    /// Number of samples with a non-empty whitespace prefix.
    pub prefixed: usize,
    /// Distinct samples with their prefix removed.
    pub stripped: BTreeSet<String>,
}

pub fn strip_samples(samples: &BTreeSet<String>) -> Stripped {
    let mut result = Stripped::default();
    for sample in samples {
        let rest = sample.trim_start_matches(is_ws_or_control);
        if rest.len() != sample.len() {
            let prefix = &sample[..sample.len() - rest.len()];
            result.ws_alphabet.extend(prefix.chars());
            result.prefixed += 1;
        }
        result.stripped.insert(rest.to_string());
    }
    result
}

pub struct Generalizer {
    config: GeneralizeConfig,
    library: Vec<Pattern>,
    next_pattern_id: usize,
    next_literal_id: usize,
    ws_ids: HashMap<BTreeSet<char>, usize>,
}

impl Generalizer {
    pub fn new(config: GeneralizeConfig) -> Self {
        Self {
            config,
            library: patterns::library(),
            next_pattern_id: 0,
            next_literal_id: 0,
            ws_ids: HashMap::new(),
        }
    }

    pub fn config(&self) -> &GeneralizeConfig {
        &self.config
    }

    fn ws_id(&mut self, ws: &BTreeSet<char>) -> usize {
        let next = self.ws_ids.len() + 1;
        *self.ws_ids.entry(ws.clone()).or_insert(next)
    }

    fn fresh_pattern_id(&mut self) -> usize {
        self.next_pattern_id += 1;
        self.next_pattern_id
    }

    fn fresh_literal(&mut self) -> String {
        self.next_literal_id += 1;
        format!("<toknt{}>", self.next_literal_id)
    }

    /// Distinct strings derived from `nt` over the configured number of draws.
    pub fn sample(&self, generator: &mut Generator<'_>, nt: &str) -> Result<BTreeSet<String>> {
        let mut samples = BTreeSet::new();
        for _ in 0..self.config.samples {
            samples.insert(generator.generate_string(nt, &Deadline::never())?);
        }
        Ok(samples)
    }

    /// Generalizes every external nonterminal of `grammar`.
    ///
    /// `alphabets` optionally supplies the characters a token may consist of;
    /// otherwise the terminals reachable from the nonterminal are used.
    pub fn generalize(
        &mut self,
        grammar: &Grammar,
        alphabets: Option<&HashMap<String, BTreeSet<char>>>,
    ) -> Result<Grammar> {
        let mut generator = Generator::new(grammar, self.config.max_depth, self.config.seed);
        let mut out = Grammar::new();
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        for (nt, rules) in grammar.iter() {
            if !is_external(nt) {
                out.insert(nt.clone(), rules.clone());
                continue;
            }
            let samples = self.sample(&mut generator, nt)?;
            let alphabet = match alphabets.and_then(|a| a.get(nt)) {
                Some(alphabet) => alphabet.clone(),
                None => grammar.terminal_alphabet(nt),
            };
            let (how, fragment) = self.generalize_token(nt, rules, &samples, &alphabet)?;
            debug!("generalized {} ({} samples): {:?}", nt, samples.len(), how);
            let key = match how {
                Generalization::LiteralWithWs(_) => "literal with whitespace",
                Generalization::Literal => "literal",
                Generalization::Pattern(_) => "pattern",
            };
            *counts.entry(key).or_default() += 1;
            out.merge(fragment);
        }
        if !counts.is_empty() {
            info!("generalized tokens: {:?}", counts);
        }
        Ok(out)
    }

    /// Chooses the generalization of one token.
    ///
    /// Returns the decision and a grammar fragment defining `nt` and every
    /// nonterminal it now refers to.
    pub fn generalize_token(
        &mut self,
        nt: &str,
        rules: &[Rule],
        samples: &BTreeSet<String>,
        alphabet: &BTreeSet<char>,
    ) -> Result<(Generalization, Grammar)> {
        let stripped = strip_samples(samples);
        let threshold = self.config.threshold_generalization;
        let ws_prefixed = stripped.prefixed > 0 && stripped.prefixed as f64 >= samples.len() as f64 * self.config.ws_ratio;
        let whitespace_only = stripped.stripped.len() == 1 && stripped.stripped.contains("");

        if ws_prefixed && stripped.stripped.len() <= threshold && !whitespace_only {
            let literal = self.fresh_literal();
            let mut grammar = Grammar::new();
            grammar.insert(literal.clone(), literal_rules(&stripped.stripped));
            let ws_id = self.ws_id(&stripped.ws_alphabet);
            let pattern = Pattern {
                regex: String::new(),
                string_nt: literal,
                char_nt: None,
                grammar,
                whitespace: false,
            }
            .with_leading_ws(&stripped.ws_alphabet, ws_id);
            let mut fragment = pattern.grammar;
            fragment.insert(nt, vec![vec![Symbol::nonterminal(pattern.string_nt.clone())]]);
            return Ok((Generalization::LiteralWithWs(pattern.string_nt), fragment));
        }

        if samples.len() <= threshold {
            let mut fragment = Grammar::new();
            fragment.insert(nt, rules.to_vec());
            return Ok((Generalization::Literal, fragment));
        }

        let library = self.library.clone();
        for base in &library {
            let mut pattern = base.clone();
            if pattern.is_simple() && !alphabet.is_empty() {
                let native = pattern.char_alphabet();
                if *alphabet != native && alphabet.is_subset(&native) {
                    let id = self.fresh_pattern_id();
                    pattern = pattern.narrowed(alphabet, id);
                }
            }

            let mut candidates = vec![pattern.clone()];
            if !pattern.whitespace && ws_prefixed {
                let ws_id = self.ws_id(&stripped.ws_alphabet);
                candidates.push(pattern.with_leading_ws(&stripped.ws_alphabet, ws_id));
            }

            for candidate in candidates {
                if !self.covers(&candidate, samples)? {
                    continue;
                }
                let single_chars = stripped.stripped.iter().all(|s| s.chars().count() <= 1);
                let root = match &candidate.char_nt {
                    Some(char_nt) if single_chars && !candidate.whitespace => char_nt.clone(),
                    _ => candidate.string_nt.clone(),
                };
                let mut fragment = candidate.grammar;
                fragment.insert(nt, vec![vec![Symbol::nonterminal(root.clone())]]);
                return Ok((Generalization::Pattern(root), fragment));
            }
        }

        debug!("no pattern covers {}, enumerating its samples", nt);
        let mut fragment = Grammar::new();
        fragment.insert(nt, literal_rules(samples));
        Ok((Generalization::Literal, fragment))
    }

    /// Does `pattern` match all but an allowed fraction of `samples`?
    pub fn covers(&self, pattern: &Pattern, samples: &BTreeSet<String>) -> Result<bool> {
        if samples.is_empty() {
            return Ok(false);
        }
        let re = pattern.matcher()?;
        let mismatches = samples.iter().filter(|s| !re.is_match(s)).count();
        Ok((mismatches as f64 / samples.len() as f64) < self.config.allowed_token_mismatch_rate)
    }
}

fn literal_rules(strings: &BTreeSet<String>) -> Vec<Rule> {
    strings.iter().map(|s| vec![Symbol::terminal(s.clone())]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::grammar::{from_literal, START};
    use test_log::test;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn generalizer() -> Generalizer {
        Generalizer::new(GeneralizeConfig::default())
    }

    #[test]
    fn test_strip_samples() {
        let stripped = strip_samples(&set(&["  if", "\twhile", "x", "   "]));
        assert_eq!(stripped.prefixed, 3);
        assert_eq!(stripped.ws_alphabet, [' ', '\t'].into_iter().collect());
        assert_eq!(stripped.stripped, set(&["if", "while", "x", ""]));
    }

    #[test]
    fn test_few_samples_stay_literal() {
        let mut g = generalizer();
        let rules: Vec<Rule> = (0..10).map(|d| vec![Symbol::terminal(d.to_string())]).collect();
        let samples: BTreeSet<String> = (0..10).map(|d| d.to_string()).collect();
        let alphabet = ('0'..='9').collect();
        let (how, fragment) = g.generalize_token("<__external_num>", &rules, &samples, &alphabet).unwrap();
        assert_eq!(how, Generalization::Literal);
        assert_eq!(fragment.alternatives("<__external_num>").len(), 10);
    }

    #[test]
    fn test_digit_run_is_generalized() {
        let mut g = generalizer();
        let samples: BTreeSet<String> = (0..40).map(|n| (n * 7919).to_string()).collect();
        let alphabet = ('0'..='9').collect();
        let (how, fragment) = g.generalize_token("<__external_num>", &[], &samples, &alphabet).unwrap();
        assert_eq!(how, Generalization::Pattern("<digits>".to_string()));
        assert!(fragment.contains("<digit>"));
        assert!(fragment.dangling_from("<__external_num>").is_empty());
    }

    #[test]
    fn test_narrowed_alphabet() {
        let mut g = generalizer();
        let samples: BTreeSet<String> = (1..40).map(|n| "ab".repeat(n)).collect();
        let alphabet = ['a', 'b'].into_iter().collect();
        let (how, fragment) = g.generalize_token("<__external_id>", &[], &samples, &alphabet).unwrap();
        assert_eq!(how, Generalization::Pattern("<lower_ascii_str_1>".to_string()));
        assert_eq!(fragment.alternatives("<lower_ascii_char_1>").len(), 2);
        assert!(fragment.dangling_from("<__external_id>").is_empty());
    }

    #[test]
    fn test_keywords_with_leading_ws() {
        let mut g = generalizer();
        let samples = set(&["if", " if", "  while", "while", "\twhile", "else", " else", "x", "y", "z", "  x", " y"]);
        let alphabet = samples.iter().flat_map(|s| s.chars()).collect();
        let (how, fragment) = g.generalize_token("<__external_kw>", &[], &samples, &alphabet).unwrap();
        let Generalization::LiteralWithWs(root) = how else {
            panic!("expected literals with whitespace, got {how:?}");
        };
        assert_eq!(root, "<pre_ws1_toknt1>");
        assert_eq!(fragment.alternatives("<toknt1>").len(), 6);
        assert_eq!(fragment.alternatives("<ws1_char>").len(), 2);
        assert!(fragment.dangling_from("<__external_kw>").is_empty());
    }

    #[test]
    fn test_whitespace_only_token_is_a_run() {
        let mut g = generalizer();
        let samples: BTreeSet<String> = (1..30).map(|n| " ".repeat(n)).chain((1..5).map(|n| "\n".repeat(n))).collect();
        let alphabet = [' ', '\n'].into_iter().collect();
        let (how, _) = g.generalize_token("<__external_ws>", &[], &samples, &alphabet).unwrap();
        assert_eq!(how, Generalization::Pattern("<ws_str_1>".to_string()));
    }

    #[test]
    fn test_single_character_preference() {
        let mut g = generalizer();
        let samples: BTreeSet<String> = ('a'..='z').map(String::from).collect();
        let alphabet = ('a'..='z').collect();
        let (how, _) = g.generalize_token("<__external_c>", &[], &samples, &alphabet).unwrap();
        assert_eq!(how, Generalization::Pattern("<lower_ascii_char>".to_string()));
    }

    #[test]
    fn test_coverage_tolerance() {
        let g = generalizer();
        let digits = patterns::library().into_iter().next().unwrap();
        let mut samples: BTreeSet<String> = (100..200).map(|n| n.to_string()).collect();
        samples.insert("x1".to_string());
        assert!(g.covers(&digits, &samples).unwrap());
        for n in 0..10 {
            samples.insert(format!("y{}", n));
        }
        assert!(!g.covers(&digits, &samples).unwrap());
    }

    #[test]
    fn test_generalize_grammar() {
        let g = from_literal(&[
            ("<start>", &[&["<main@0>"]]),
            ("<main@0>", &[&["<__external_num@0>"]]),
            ("<__external_num@0>", &[&["<d>", "<__external_num@0>"], &["<d>"]]),
            (
                "<d>",
                &[&["0"], &["1"], &["2"], &["3"], &["4"], &["5"], &["6"], &["7"], &["8"], &["9"]],
            ),
        ]);
        let mut generalizer = generalizer();
        let out = generalizer.generalize(&g, None).unwrap();
        assert_eq!(out.alternatives("<__external_num@0>"), &[crate::symbol::rule(["<digits>"])]);
        assert!(out.dangling_from(START).is_empty());
        assert_eq!(out.nonterminals().next().map(String::as_str), Some(START));
        assert_eq!(out.alternatives("<main@0>"), g.alternatives("<main@0>"));
    }
}
