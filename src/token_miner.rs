//! Token grammars for token-cursor subjects.
//!
//! A token-cursor subject reads tokens from a lexer instead of bytes. The
//! lexer is explored separately: each token trace records the bytes read
//! while the lexer produced one token, plus the id of that token:
//!
//! ```json
//! {"token_id": 7, "0": {"readorders": [1], "executioncontexts": [[]], "solutions": [105]}}
//! ```
//!
//! Every trace contributes one sample string for its token (one random
//! solution per position) and all non-null solutions to the token's alphabet.
//! The samples of token `id` become `<__external_id>`, referenced by
//! `<TOK_id>`, and are generalized with the per-token alphabet.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use log::{debug, info};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use crate::config::MinerConfig;
use crate::error::{Error, Result};
use crate::generalize::Generalizer;
use crate::grammar::Grammar;
use crate::symbol::Symbol;
use crate::trace::{de_id, trace_files, PositionRecord, Trace};

/// One trace of the lexer.
#[derive(Debug, Clone)]
pub struct TokenTrace {
    pub token_id: String,
    pub trace: Trace,
}

impl TokenTrace {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let mut object: serde_json::Map<String, Value> = serde_json::from_str(s)?;
        let id = object.remove("token_id").ok_or(Error::MissingTokenId)?;
        let token_id = de_id(id)?;
        let records: BTreeMap<String, PositionRecord> = serde_json::from_value(Value::Object(object))?;
        Ok(Self {
            token_id,
            trace: Trace::from_records(records)?,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json_str(&text)
    }
}

/// Sort key for token ids: numeric ids in numeric order, then the rest.
fn id_key(id: &str) -> (Option<u64>, &str) {
    (id.parse().ok(), id)
}

pub struct TokenMiner {
    config: MinerConfig,
    rng: ChaCha8Rng,
    samples: HashMap<String, Vec<String>>,
    alphabets: HashMap<String, BTreeSet<char>>,
}

impl TokenMiner {
    pub fn new(config: MinerConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.generalize.seed);
        Self {
            config,
            rng,
            samples: HashMap::new(),
            alphabets: HashMap::new(),
        }
    }

    /// Number of distinct tokens seen.
    pub fn token_count(&self) -> usize {
        self.samples.len()
    }

    pub fn add_trace(&mut self, token: &TokenTrace) -> Result<()> {
        let mut positions = token.trace.positions();
        let order = &self.config.order;
        if order.drop_trailing_lookahead {
            if let [rest @ .., last] = positions {
                if !rest.is_empty() && last.solutions.len() > order.unconstrained_solution_count {
                    positions = rest;
                }
            }
            if let [rest @ .., last] = positions {
                if !rest.is_empty() && last.solutions == [0] {
                    positions = rest;
                }
            }
        }

        let alphabet = self.alphabets.entry(token.token_id.clone()).or_default();
        let mut sample = String::with_capacity(positions.len());
        for record in positions {
            let Some(&value) = record.solutions.choose(&mut self.rng) else {
                continue;
            };
            sample.push(byte_char(value)?);
            for &value in &record.solutions {
                if value != 0 {
                    alphabet.insert(byte_char(value)?);
                }
            }
        }

        let samples = self.samples.entry(token.token_id.clone()).or_default();
        if !samples.contains(&sample) {
            debug!("token {}: sample {:?}", token.token_id, sample);
            samples.push(sample);
        }
        Ok(())
    }

    /// Adds every token trace in `dir`; returns the number of files read.
    pub fn add_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let files = trace_files(dir)?;
        for file in &files {
            debug!("loading token trace {}", file.display());
            self.add_trace(&TokenTrace::load(file)?)?;
        }
        Ok(files.len())
    }

    /// The ungeneralized token grammar and the alphabet of each token.
    pub fn raw_grammar(&self) -> (Grammar, HashMap<String, BTreeSet<char>>) {
        let mut ids: Vec<&String> = self.samples.keys().collect();
        ids.sort_by(|a, b| id_key(a).cmp(&id_key(b)));

        let mut grammar = Grammar::new();
        let mut alphabets = HashMap::new();
        for id in ids {
            let external = format!("<__external_{}>", id);
            let rules = self.samples[id].iter().map(|s| vec![Symbol::terminal(s.clone())]).collect();
            grammar.insert(external.clone(), rules);
            grammar.insert(format!("<TOK_{}>", id), vec![vec![Symbol::nonterminal(external.clone())]]);
            alphabets.insert(external, self.alphabets.get(id).cloned().unwrap_or_default());
        }
        (grammar, alphabets)
    }

    /// Generalizes the collected samples into the token grammar.
    pub fn finish(self) -> Result<Grammar> {
        let (grammar, alphabets) = self.raw_grammar();
        let mut generalizer = Generalizer::new(self.config.generalize.clone());
        let generalized = generalizer.generalize(&grammar, Some(&alphabets))?;
        info!("mined token grammar for {} tokens", self.samples.len());
        Ok(generalized)
    }
}

fn byte_char(value: u32) -> Result<char> {
    u8::try_from(value).map(char::from).map_err(|_| Error::SolutionOutOfRange(value))
}

/// Mines a token grammar from all token traces in `dirs`.
pub fn mine_tokens<P: AsRef<Path>>(dirs: &[P], config: &MinerConfig) -> Result<Grammar> {
    let mut miner = TokenMiner::new(config.clone());
    for dir in dirs {
        let n = miner.add_dir(dir)?;
        info!("read {} token traces from {}", n, dir.as_ref().display());
    }
    miner.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    fn token(id: u32, bytes: &[&[u32]]) -> TokenTrace {
        let positions: Vec<String> = bytes
            .iter()
            .enumerate()
            .map(|(i, solutions)| {
                format!(
                    r#""{}": {{"readorders": [{}], "executioncontexts": [[]], "solutions": {:?}}}"#,
                    i,
                    i + 1,
                    solutions
                )
            })
            .collect();
        TokenTrace::from_json_str(&format!(r#"{{"token_id": {}, {}}}"#, id, positions.join(", "))).unwrap()
    }

    #[test]
    fn test_parse_token_trace() {
        let t = token(7, &[&[105], &[102]]);
        assert_eq!(t.token_id, "7");
        assert_eq!(t.trace.len(), 2);
        assert!(TokenTrace::from_json_str(r#"{"0": {"solutions": [1]}}"#).is_err());
    }

    #[test]
    fn test_raw_grammar() {
        let mut miner = TokenMiner::new(MinerConfig::default());
        miner.add_trace(&token(10, &[&[43]])).unwrap();
        miner.add_trace(&token(2, &[&[105], &[102], &[0]])).unwrap();
        miner.add_trace(&token(2, &[&[105], &[102]])).unwrap();
        let (g, alphabets) = miner.raw_grammar();
        let names: Vec<&String> = g.nonterminals().collect();
        assert_eq!(names, vec!["<__external_2>", "<TOK_2>", "<__external_10>", "<TOK_10>"]);
        // The trailing null byte is dropped, so both traces give "if".
        assert_eq!(g.alternatives("<__external_2>"), &[crate::symbol::rule(["if"])]);
        assert_eq!(alphabets["<__external_2>"], ['f', 'i'].into_iter().collect());
    }

    #[test]
    fn test_alphabet_collects_all_solutions() {
        let mut miner = TokenMiner::new(MinerConfig::default());
        miner.add_trace(&token(1, &[&[97, 98, 0], &[99]])).unwrap();
        let (_, alphabets) = miner.raw_grammar();
        assert_eq!(alphabets["<__external_1>"], ['a', 'b', 'c'].into_iter().collect());
    }

    #[test]
    fn test_unconstrained_lookahead_dropped() {
        let mut miner = TokenMiner::new(MinerConfig::default());
        let any: Vec<u32> = (1..=100).collect();
        miner.add_trace(&token(3, &[&[43], &any])).unwrap();
        let (g, _) = miner.raw_grammar();
        assert_eq!(g.alternatives("<__external_3>"), &[crate::symbol::rule(["+"])]);
    }

    #[test]
    fn test_finish_generalizes_numbers() {
        let mut miner = TokenMiner::new(MinerConfig::default());
        for n in 0..30u32 {
            let digits: Vec<Vec<u32>> = (n * 37).to_string().bytes().map(|b| vec![u32::from(b)]).collect();
            let refs: Vec<&[u32]> = digits.iter().map(Vec::as_slice).collect();
            miner.add_trace(&token(5, &refs)).unwrap();
        }
        miner.add_trace(&token(6, &[&[59]])).unwrap();
        let g = miner.finish().unwrap();
        assert_eq!(g.alternatives("<TOK_5>"), &[crate::symbol::rule(["<__external_5>"])]);
        assert_eq!(g.alternatives("<__external_5>"), &[crate::symbol::rule(["<digits>"])]);
        assert_eq!(g.alternatives("<__external_6>"), &[crate::symbol::rule([";"])]);
    }
}
