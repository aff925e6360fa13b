//! The mining pipeline.
//!
//! ```text
//! trace files -> order_trace -> build_tree -> extract_into    (per trace)
//!             -> fix_loops -> generalize | merge token grammar
//!             -> tidy -> prune unreachable -> validate
//! ```
//!
//! A [`Miner`] owns everything that must be shared between the traces of one
//! subject: the grammar under construction and the [`LabelState`] that keeps
//! call-context and bucket ids stable. Separate miners are fully independent.

use std::fmt;
use std::path::Path;

use log::{debug, info, warn};

use crate::config::MinerConfig;
use crate::error::{Error, Result};
use crate::exec_tree::{build_tree, ExecNode, LabelState};
use crate::extract::{extract_into, fix_loops, TerminalMode};
use crate::generalize::Generalizer;
use crate::grammar::{Grammar, START};
use crate::order::order_trace;
use crate::tidy::tidy;
use crate::trace::{trace_files, Trace};

/// Counters reported at the end of mining.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MiningStats {
    pub traces: usize,
    /// Traces whose read order needed repair.
    pub fixed_traces: usize,
    /// Positions repaired across all traces.
    pub fixed_positions: usize,
    /// Traces skipped because no consistent read order was found.
    pub skipped: usize,
}

impl fmt::Display for MiningStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} traces, {} fixed traces, {} fixed positions, {} skipped",
            self.traces, self.fixed_traces, self.fixed_positions, self.skipped
        )
    }
}

pub struct Miner<'t> {
    config: MinerConfig,
    token_grammar: Option<&'t Grammar>,
    labels: LabelState,
    grammar: Grammar,
    stats: MiningStats,
}

impl<'t> Miner<'t> {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            token_grammar: None,
            labels: LabelState::new(),
            grammar: Grammar::new(),
            stats: MiningStats::default(),
        }
    }

    /// Switches to token-cursor mode: buckets hold ids of tokens in `tokens`.
    pub fn with_token_grammar(mut self, tokens: &'t Grammar) -> Self {
        self.token_grammar = Some(tokens);
        self
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn stats(&self) -> MiningStats {
        self.stats
    }

    /// The grammar extracted so far, before any post-processing.
    pub fn raw_grammar(&self) -> &Grammar {
        &self.grammar
    }

    fn terminal_mode(&self) -> TerminalMode<'t> {
        match self.token_grammar {
            Some(tokens) => TerminalMode::Tokens(tokens),
            None => TerminalMode::Bytes,
        }
    }

    /// Orders one trace and extracts its rules.
    ///
    /// Returns the execution tree of the trace, or `None` if the trace could
    /// not be ordered and was skipped.
    pub fn add_trace(&mut self, trace: &Trace) -> Result<Option<ExecNode>> {
        let ordered = match order_trace(trace, &self.config.order) {
            Ok(ordered) => ordered,
            Err(Error::UnorderableTrace(rounds)) => {
                warn!("skipping trace: no consistent read order after {} repair rounds", rounds);
                self.stats.skipped += 1;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        self.stats.traces += 1;
        if ordered.was_fixed() {
            self.stats.fixed_traces += 1;
            self.stats.fixed_positions += ordered.fixed_positions();
        }

        let keep_null = self.token_grammar.is_some();
        let Some(root) = build_tree(&ordered, &mut self.labels, self.config.context, keep_null) else {
            return Ok(None);
        };
        debug!("execution tree {} has {} nodes", root.label, root.size());
        let mode = self.terminal_mode();
        extract_into(&mut self.grammar, &root, mode)?;
        Ok(Some(root))
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<Option<ExecNode>> {
        let trace = Trace::load(path)?;
        self.add_trace(&trace)
    }

    /// Adds every trace in `dir`, in file-name order.
    pub fn add_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let files = trace_files(dir)?;
        for file in &files {
            debug!("loading {}", file.display());
            self.add_file(file)?;
        }
        Ok(files.len())
    }

    fn snapshot(&self, grammar: &Grammar, name: &str) -> Result<()> {
        match &self.config.snapshot_dir {
            Some(dir) => grammar.save(dir.join(name)),
            None => Ok(()),
        }
    }

    /// Post-processes the extracted rules into the final grammar.
    pub fn finish(self) -> Result<Grammar> {
        info!("mining done: {}", self.stats);
        let mut grammar = self.grammar.clone();
        if grammar.is_empty() {
            return Err(Error::MissingStart);
        }
        self.snapshot(&grammar, "raw_grammar.json")?;

        let collapsed = fix_loops(&mut grammar);
        if !collapsed.is_empty() {
            info!("{} loops never iterated", collapsed.len());
        }
        self.snapshot(&grammar, "loop_fixed_grammar.json")?;

        grammar = match self.token_grammar {
            Some(tokens) => grammar.merged_with(tokens),
            None => Generalizer::new(self.config.generalize.clone()).generalize(&grammar, None)?,
        };
        self.snapshot(&grammar, "generalized_grammar.json")?;

        if self.config.simplify {
            tidy(&mut grammar);
        }
        let pruned = grammar.prune_unreachable(START);
        debug!("pruned {} unreachable nonterminals", pruned.len());
        grammar.validate()?;
        info!("mined grammar with {} nonterminals", grammar.len());
        Ok(grammar)
    }
}

/// Mines a grammar from every trace in `dir`.
pub fn mine(dir: impl AsRef<Path>, config: &MinerConfig, tokens: Option<&Grammar>) -> Result<Grammar> {
    let mut miner = Miner::new(config.clone());
    if let Some(tokens) = tokens {
        miner = miner.with_token_grammar(tokens);
    }
    let n = miner.add_dir(dir.as_ref())?;
    info!("read {} trace files from {}", n, dir.as_ref().display());
    miner.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::symbol::rule;
    use crate::trace::{Frame, PositionRecord};
    use test_log::test;

    fn position(order: u64, frames: &[(&str, &str)], solutions: &[u32]) -> PositionRecord {
        let context = frames.iter().map(|(callee, site)| Frame::new(*callee, *site)).collect();
        PositionRecord {
            readorders: vec![order],
            executioncontexts: vec![context],
            solutions: solutions.to_vec(),
        }
    }

    fn trace(positions: Vec<PositionRecord>) -> Trace {
        let records: BTreeMap<String, PositionRecord> =
            positions.into_iter().enumerate().map(|(i, p)| (i.to_string(), p)).collect();
        Trace::from_records(records).unwrap()
    }

    #[test]
    fn test_single_digit_stays_literal() {
        let digits: Vec<u32> = (b'0'..=b'9').map(u32::from).collect();
        let mut miner = Miner::new(MinerConfig::default());
        miner
            .add_trace(&trace(vec![position(1, &[("main", "0"), ("digit", "1")], &digits)]))
            .unwrap();
        let g = miner.finish().unwrap();
        let leaf = g
            .iter()
            .find(|(_, alternatives)| alternatives.len() == 10)
            .map(|(nt, _)| nt.clone())
            .unwrap();
        assert!(g.alternatives(&leaf).iter().all(|r| r.len() == 1 && r[0].as_str().len() == 1));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn test_traces_share_rules() {
        let mut miner = Miner::new(MinerConfig {
            simplify: false,
            ..MinerConfig::default()
        });
        miner
            .add_trace(&trace(vec![
                position(1, &[("main", "0"), ("num", "1")], &[49]),
                position(2, &[("main", "0")], &[43]),
            ]))
            .unwrap();
        miner
            .add_trace(&trace(vec![position(1, &[("main", "0"), ("num", "1")], &[50])]))
            .unwrap();
        assert_eq!(miner.stats().traces, 2);
        let g = miner.finish().unwrap();
        assert_eq!(g.alternatives(START), &[rule(["<main@0>"])]);
        assert_eq!(g.alternatives("<main@0>"), &[rule(["<num@0>", "<__T2>"]), rule(["<num@0>"])]);
        assert_eq!(g.alternatives("<num@0>"), &[rule(["<__T1>"]), rule(["<__T3>"])]);
    }

    #[test]
    fn test_start_mismatch() {
        let mut miner = Miner::new(MinerConfig::default());
        miner.add_trace(&trace(vec![position(1, &[("main", "0")], &[49])])).unwrap();
        let other = trace(vec![position(1, &[("other", "0")], &[49])]);
        assert!(matches!(miner.add_trace(&other), Err(Error::StartMismatch { .. })));
    }

    #[test]
    fn test_stats_count_repairs() {
        let mut miner = Miner::new(MinerConfig::default());
        let mut reread = position(1, &[("main", "0")], &[49]);
        reread.readorders.push(9);
        reread.executioncontexts.push(vec![Frame::new("main", "0")]);
        miner
            .add_trace(&trace(vec![reread, position(5, &[("main", "0")], &[50])]))
            .unwrap();
        assert_eq!(
            miner.stats(),
            MiningStats {
                traces: 1,
                fixed_traces: 1,
                fixed_positions: 1,
                skipped: 0
            }
        );
    }

    #[test]
    fn test_token_mode_merges_token_grammar() {
        let tokens = crate::grammar::from_literal(&[
            ("<TOK_1>", &[&["<__external_1>"]]),
            ("<__external_1>", &[&["if"]]),
            ("<TOK_2>", &[&["<__external_2>"]]),
            ("<__external_2>", &[&["("]]),
        ]);
        let mut miner = Miner::new(MinerConfig::default()).with_token_grammar(&tokens);
        miner
            .add_trace(&trace(vec![position(1, &[("parse", "0")], &[1]), position(2, &[("parse", "0")], &[2])]))
            .unwrap();
        let g = miner.finish().unwrap();
        assert!(g.validate().is_ok());
        let text = crate::generator::sample_strings(&g, 1, 5, 0, std::time::Duration::from_secs(1)).unwrap();
        assert_eq!(text, vec!["if(".to_string()]);
    }
}
