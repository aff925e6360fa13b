//! Overapproximation Refiner.
//!
//! A mined grammar usually accepts far more than the subject does. The
//! [`Refiner`] shrinks it by counterexample-guided refinement:
//!
//! 1. **Sampling.** Generate inputs from the grammar and classify them with
//!    the program oracle. Precision is the fraction of accepted inputs. Once
//!    it reaches the threshold, refinement has converged.
//! 2. **Counterexamples.** The shortest rejected inputs are tried in order
//!    of increasing length.
//! 3. **Search.** The counterexample is parsed and its tree searched
//!    bottom-up. At a node whose children offer nothing better, each of the
//!    node's alternatives is scored by splicing `k_subtrees` random
//!    derivations of it into the counterexample tree and asking the oracle.
//!    The best-scoring alternatives become the node's new rule set.
//! 4. **Validation.** A candidate must still parse every input the subject
//!    is known to accept. A candidate that fails is kept under a fresh name
//!    (`<X_refined_N>`) and handed to the parent, which tries to use it in
//!    the context of its own rule instead. The input that refuted the
//!    candidate is remembered and checked first from then on.
//! 5. **Commit.** A candidate accepted at the root of the tree is merged into
//!    the grammar, duplicate nonterminals are collapsed and sampling starts
//!    over.
//!
//! The loop ends when precision is reached, when no counterexample among the
//! shortest ones yields a refinement, or when the iteration or time budget is
//! spent. Oracle calls (sampling and probing) run on the rayon pool; grammar
//! state has a single writer.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use log::{debug, info, trace, warn};

use crate::config::RefinementConfig;
use crate::deadline::{CancellationToken, Deadline};
use crate::error::{Error, Result};
use crate::generator::Generator;
use crate::grammar::{same_alternatives, Grammar, Rule, START};
use crate::oracle::{Oracle, Verdict};
use crate::parser::{EarleyParser, ParseOutcome, Recognition};
use crate::symbol::{bare_name, Symbol};
use crate::tree::{NodeId, TreeArena};

/// Why refinement stopped.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Precision reached the threshold.
    Converged,
    /// No counterexample among the shortest ones could be used.
    Exhausted,
    /// `max_refinements` refinements were committed.
    IterationBudget,
    /// `max_refinement_time` elapsed.
    TimeBudget,
    /// The cancellation token was triggered.
    Cancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::Converged => "precision threshold reached",
            Termination::Exhausted => "no refineable counterexample",
            Termination::IterationBudget => "refinement budget spent",
            Termination::TimeBudget => "time budget spent",
            Termination::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Classified samples of one sampling round.
#[derive(Debug, Clone, Default)]
pub struct Sample {
    /// Distinct accepted inputs.
    pub valid: BTreeSet<String>,
    /// Distinct rejected inputs.
    pub invalid: BTreeSet<String>,
    /// Inputs that crashed the subject or timed out.
    pub inconclusive: usize,
}

impl Sample {
    /// `|valid| / |valid ∪ invalid|`, `None` if nothing was classified.
    pub fn precision(&self) -> Option<f64> {
        let total = self.valid.len() + self.invalid.len();
        (total > 0).then(|| self.valid.len() as f64 / total as f64)
    }

    /// Rejected inputs, shortest first.
    pub fn shortest_invalid(&self, k: usize) -> Vec<&String> {
        let mut invalid: Vec<&String> = self.invalid.iter().collect();
        invalid.sort_by_key(|s| s.chars().count());
        invalid.truncate(k);
        invalid
    }
}

/// Generates inputs from `grammar` and classifies them until
/// `cnt_inputs_refinement` inputs were classified and at least
/// `min_count_valid` of them are valid, or the attempt budget runs out.
pub fn sample_and_classify<O: Oracle + ?Sized>(
    grammar: &Grammar,
    oracle: &O,
    config: &RefinementConfig,
    seed: u64,
    token: Option<&CancellationToken>,
) -> Result<Sample> {
    let mut generator = Generator::new(grammar, config.max_depth, seed);
    let budget = config
        .cnt_inputs_refinement
        .saturating_mul(config.max_sampling_attempts_factor)
        .max(1);
    let mut sample = Sample::default();
    let mut classified = 0;
    let mut attempts = 0;
    while (classified < config.cnt_inputs_refinement || sample.valid.len() < config.min_count_valid) && attempts < budget {
        if token.is_some_and(CancellationToken::is_cancelled) {
            break;
        }
        let wanted = config.cnt_inputs_refinement.saturating_sub(classified).max(1).min(budget - attempts);
        let mut batch = Vec::with_capacity(wanted);
        for _ in 0..wanted {
            attempts += 1;
            match generator.generate_string(START, &deadline(config.generation_timeout, token)) {
                Ok(input) => batch.push(input),
                Err(Error::Interrupted) => debug!("generation timed out, skipping"),
                Err(e) => return Err(e),
            }
        }
        let verdicts = oracle.classify_all(&batch, config.parallel);
        for (input, verdict) in batch.into_iter().zip(verdicts) {
            match verdict {
                Verdict::Accept => {
                    sample.valid.insert(input);
                    classified += 1;
                }
                Verdict::Reject => {
                    sample.invalid.insert(input);
                    classified += 1;
                }
                Verdict::Inconclusive => sample.inconclusive += 1,
            }
        }
    }
    if classified < config.cnt_inputs_refinement {
        warn!(
            "only {} of {} inputs classified after {} attempts",
            classified, config.cnt_inputs_refinement, attempts
        );
    }
    Ok(sample)
}

/// Precision of `grammar` with respect to `oracle`.
pub fn precision<O: Oracle + ?Sized>(grammar: &Grammar, oracle: &O, config: &RefinementConfig) -> Result<Option<f64>> {
    Ok(sample_and_classify(grammar, oracle, config, config.seed, None)?.precision())
}

fn deadline(timeout: Duration, token: Option<&CancellationToken>) -> Deadline {
    let deadline = Deadline::after(timeout);
    match token {
        Some(token) => deadline.with_token(token.clone()),
        None => deadline,
    }
}

/// A refinement proposed by the search at one tree node.
#[derive(Debug, Clone)]
struct Candidate {
    /// Definitions to merge into the grammar.
    update: Grammar,
    /// The nonterminal the update stands for: the node itself if the update
    /// was validated there, otherwise a fresh `<X_refined_N>`.
    nt: String,
    /// Probes accepted by the oracle for the best rule set.
    quality: usize,
    accepted: bool,
}

/// The counterexample tree and everything derived from the current grammar.
struct Search<'g> {
    grammar: &'g Grammar,
    generator: Generator<'g>,
    arena: TreeArena,
    root: NodeId,
}

/// Does some alternative avoid recursing into `nt` right away?
fn terminates(nt: &str, rules: &[Rule]) -> bool {
    rules.is_empty() || rules.iter().any(|rule| !rule.iter().any(|s| s.nonterminal_name() == Some(nt)))
}

fn dedup_rules(rules: Vec<Rule>) -> Vec<Rule> {
    let mut unique: Vec<Rule> = Vec::with_capacity(rules.len());
    for rule in rules {
        if !unique.contains(&rule) {
            unique.push(rule);
        }
    }
    unique
}

/// Result of a whole refinement run.
#[derive(Debug, Clone)]
pub struct RefinementReport {
    pub grammar: Grammar,
    pub termination: Termination,
    /// Committed refinements.
    pub refinements: usize,
    /// Precision measured at the start of every round.
    pub precision_history: Vec<f64>,
    pub elapsed: Duration,
}

/// Outcome of one sampling and search round.
enum Round {
    Converged(Option<f64>),
    Exhausted(Option<f64>),
    Refined(Grammar, Option<f64>),
}

pub struct Refiner<'o, O: Oracle + ?Sized> {
    oracle: &'o O,
    config: RefinementConfig,
    /// Inputs that refuted earlier candidates; checked first.
    discriminating: IndexSet<String>,
    /// Every input the oracle accepted so far.
    confirmed: BTreeSet<String>,
    /// Next suffix of `<X_refined_N>` per nonterminal.
    names: HashMap<String, usize>,
    token: Option<CancellationToken>,
}

impl<'o, O: Oracle + ?Sized> Refiner<'o, O> {
    pub fn new(oracle: &'o O, config: RefinementConfig) -> Self {
        Self {
            oracle,
            config,
            discriminating: IndexSet::new(),
            confirmed: BTreeSet::new(),
            names: HashMap::new(),
            token: None,
        }
    }

    /// Stops refinement and abandons running parses once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn config(&self) -> &RefinementConfig {
        &self.config
    }

    pub fn discriminating_inputs(&self) -> impl Iterator<Item = &String> {
        self.discriminating.iter()
    }

    pub fn confirmed_inputs(&self) -> impl Iterator<Item = &String> {
        self.confirmed.iter()
    }

    /// Adds inputs known to be valid, e.g. the seeds the traces came from.
    pub fn add_valid_inputs(&mut self, inputs: impl IntoIterator<Item = String>) {
        self.confirmed.extend(inputs);
    }

    fn cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn parse_deadline(&self) -> Deadline {
        deadline(self.config.parse_timeout, self.token.as_ref())
    }

    /// The next `<X_refined_N>` not yet defined in `grammar`.
    fn fresh_name(&mut self, grammar: &Grammar, nt: &str) -> String {
        let counter = self.names.entry(nt.to_string()).or_insert(0);
        loop {
            let name = format!("<{}_refined_{}>", bare_name(nt), counter);
            *counter += 1;
            if !grammar.contains(&name) {
                return name;
            }
        }
    }

    /// Runs refinement rounds until one of the stop conditions holds.
    pub fn refine(&mut self, grammar: Grammar) -> Result<RefinementReport> {
        let start = Instant::now();
        let mut grammar = grammar;
        let mut refinements = 0;
        let mut history = Vec::new();
        let termination = loop {
            if self.cancelled() {
                break Termination::Cancelled;
            }
            if refinements >= self.config.max_refinements {
                break Termination::IterationBudget;
            }
            if start.elapsed() >= self.config.max_refinement_time {
                break Termination::TimeBudget;
            }
            let round = self.refine_once(&grammar, refinements)?;
            let (Round::Converged(p) | Round::Exhausted(p) | Round::Refined(_, p)) = &round;
            history.extend(*p);
            match round {
                Round::Converged(_) => break Termination::Converged,
                Round::Exhausted(_) => break Termination::Exhausted,
                Round::Refined(refined, _) => {
                    refinements += 1;
                    grammar = refined;
                    info!("refinement {}: grammar has {} nonterminals", refinements, grammar.len());
                    self.snapshot(&grammar, &format!("refined_grammar_{}.json", refinements))?;
                }
            }
        };
        self.snapshot(&grammar, "refined_grammar_final.json")?;
        let elapsed = start.elapsed();
        info!(
            "refinement stopped after {} refinements in {:.1?}: {}",
            refinements, elapsed, termination
        );
        Ok(RefinementReport {
            grammar,
            termination,
            refinements,
            precision_history: history,
            elapsed,
        })
    }

    fn snapshot(&self, grammar: &Grammar, name: &str) -> Result<()> {
        match &self.config.snapshot_dir {
            Some(dir) => grammar.save(dir.join(name)),
            None => Ok(()),
        }
    }

    /// One sampling round followed by a search over the shortest
    /// counterexamples.
    fn refine_once(&mut self, grammar: &Grammar, round: usize) -> Result<Round> {
        let seed = self.config.seed.wrapping_add(round as u64);
        let sample = sample_and_classify(grammar, self.oracle, &self.config, seed, self.token.as_ref())?;
        let precision = sample.precision();
        info!(
            "round {}: precision {}/{} ({} inconclusive)",
            round,
            sample.valid.len(),
            sample.valid.len() + sample.invalid.len(),
            sample.inconclusive
        );
        self.confirmed.extend(sample.valid.iter().cloned());

        match precision {
            None => {
                warn!("no input could be classified");
                return Ok(Round::Exhausted(None));
            }
            Some(p) if p >= self.config.precision_threshold => return Ok(Round::Converged(precision)),
            Some(_) => {}
        }

        for (i, input) in sample.shortest_invalid(self.config.k_shortest).into_iter().enumerate() {
            if self.cancelled() {
                break;
            }
            debug!("counterexample {}: {:?}", i, input);
            let seed = seed.wrapping_mul(31).wrapping_add(i as u64);
            if let Some(refined) = self.refine_for_input(grammar, input, seed)? {
                if refined == *grammar {
                    debug!("refinement left the grammar unchanged");
                    continue;
                }
                return Ok(Round::Refined(refined, precision));
            }
        }
        info!("no refineable counterexample among the {} shortest", self.config.k_shortest);
        Ok(Round::Exhausted(precision))
    }

    /// Tries to refine `grammar` so that it no longer derives `input`.
    ///
    /// Returns the refined grammar, or `None` if the input could not be
    /// parsed in time or the search found no acceptable refinement.
    pub fn refine_for_input(&mut self, grammar: &Grammar, input: &str, seed: u64) -> Result<Option<Grammar>> {
        let parser = EarleyParser::new(grammar);
        let mut arena = TreeArena::new();
        let root = match parser.parse(&mut arena, input, &self.parse_deadline()) {
            ParseOutcome::Tree(root) => root,
            ParseOutcome::NoParse => {
                warn!("counterexample {:?} is not derivable from the grammar", input);
                return Ok(None);
            }
            ParseOutcome::Timeout => {
                warn!("parsing counterexample {:?} timed out", input);
                return Ok(None);
            }
        };
        let mut search = Search {
            grammar,
            generator: Generator::new(grammar, self.config.max_depth, seed),
            arena,
            root,
        };
        let mut path = Vec::new();
        let candidate = match self.search(&mut search, root, &mut path)? {
            Some(candidate) if candidate.accepted => candidate,
            _ => return Ok(None),
        };
        info!("refined {} (quality {}/{})", candidate.nt, candidate.quality, self.config.k_subtrees);
        Ok(Some(commit(grammar, candidate.update)))
    }

    /// Bottom-up search below `node`, which `path` addresses from the root.
    fn search(&mut self, search: &mut Search<'_>, node: NodeId, path: &mut Vec<usize>) -> Result<Option<Candidate>> {
        let Some(nt) = search.arena.symbol(node).nonterminal_name().map(str::to_string) else {
            return Ok(None);
        };
        trace!("searching {} at {:?}", nt, path);

        let children = search.arena.children(node).to_vec();
        let mut best: Option<(usize, Candidate)> = None;
        for (i, child) in children.into_iter().enumerate() {
            path.push(i);
            let result = self.search(search, child, path);
            path.pop();
            let Some(candidate) = result? else {
                continue;
            };
            if candidate.accepted {
                return Ok(Some(candidate));
            }
            if best.as_ref().map_or(true, |(_, b)| candidate.quality > b.quality) {
                best = Some((i, candidate));
            }
        }

        if let Some((i, candidate)) = best {
            if candidate.quality > 0 {
                return Ok(Some(self.refine_in_parent(search, node, &nt, i, candidate)));
            }
        }
        self.refine_alternatives(search, &nt, path)
    }

    /// Uses the unresolved refinement of child `index` inside the rule that
    /// `node` applies.
    fn refine_in_parent(
        &mut self,
        search: &Search<'_>,
        node: NodeId,
        nt: &str,
        index: usize,
        child: Candidate,
    ) -> Candidate {
        let current = search.arena.rule_at(node);
        let mut updated = current.clone();
        updated[index] = Symbol::nonterminal(child.nt.clone());

        let rules: Vec<Rule> = search
            .grammar
            .alternatives(nt)
            .iter()
            .map(|rule| if *rule == current { updated.clone() } else { rule.clone() })
            .collect();
        let mut update = child.update.clone();
        update.insert(nt, dedup_rules(rules.clone()));
        if !self.is_underapproximating(search.grammar, &update) {
            return Candidate {
                update,
                nt: nt.to_string(),
                quality: child.quality,
                accepted: true,
            };
        }

        let name = self.fresh_name(search.grammar, nt);
        let mut update = child.update;
        update.insert(name.clone(), dedup_rules(rules));
        Candidate {
            update,
            nt: name,
            quality: child.quality,
            accepted: false,
        }
    }

    /// Scores every alternative of `nt` and proposes the best ones.
    fn refine_alternatives(&mut self, search: &mut Search<'_>, nt: &str, path: &[usize]) -> Result<Option<Candidate>> {
        let alternatives = search.grammar.alternatives(nt).to_vec();
        let qualities = self.rule_qualities(search, nt, alternatives.len(), path)?;
        debug!("{}: rule qualities {:?}", nt, qualities);

        let Some(&max_quality) = qualities.iter().max() else {
            return Ok(None);
        };
        if max_quality == 0 {
            return Ok(None);
        }
        let best: Vec<Rule> = alternatives
            .iter()
            .zip(&qualities)
            .filter(|(_, &q)| q == max_quality)
            .map(|(rule, _)| rule.clone())
            .collect();
        if same_alternatives(&best, &alternatives) || !terminates(nt, &best) {
            return Ok(None);
        }

        let mut update = Grammar::new();
        update.insert(nt, best.clone());
        if !self.is_underapproximating(search.grammar, &update) {
            return Ok(Some(Candidate {
                update,
                nt: nt.to_string(),
                quality: max_quality,
                accepted: true,
            }));
        }
        let name = self.fresh_name(search.grammar, nt);
        debug!("{}: best rules underapproximate, trying {} in context", nt, name);
        let mut update = Grammar::new();
        update.insert(name.clone(), best);
        Ok(Some(Candidate {
            update,
            nt: name,
            quality: max_quality,
            accepted: false,
        }))
    }

    /// For each alternative, the number of probes accepted by the oracle.
    ///
    /// A probe replaces the subtree at `path` by a fresh derivation of `nt`
    /// that starts with the alternative.
    fn rule_qualities(&self, search: &mut Search<'_>, nt: &str, count: usize, path: &[usize]) -> Result<Vec<usize>> {
        let mut probes: Vec<String> = Vec::with_capacity(count * self.config.k_subtrees);
        let mut owners: Vec<usize> = Vec::with_capacity(probes.capacity());
        for choice in 0..count {
            for _ in 0..self.config.k_subtrees {
                let deadline = deadline(self.config.generation_timeout, self.token.as_ref());
                let subtree = match search.generator.generate_with_first_choice(&mut search.arena, nt, choice, &deadline) {
                    Ok(subtree) => subtree,
                    Err(Error::Interrupted | Error::Unproductive(_)) => continue,
                    Err(e) => return Err(e),
                };
                let spliced = search.arena.splice(search.root, path, subtree);
                probes.push(search.arena.yield_string(spliced));
                owners.push(choice);
            }
        }
        let verdicts = self.oracle.classify_all(&probes, self.config.parallel);
        let mut qualities = vec![0; count];
        for (choice, verdict) in owners.into_iter().zip(verdicts) {
            if verdict == Verdict::Accept {
                qualities[choice] += 1;
            }
        }
        Ok(qualities)
    }

    /// Does `grammar` with `update` merged in fail to parse a known-valid input?
    ///
    /// Inputs that refute the update are remembered. Reaching
    /// `stop_after_k_timeouts` consecutive parse timeouts also counts as a
    /// refutation.
    pub fn is_underapproximating(&mut self, grammar: &Grammar, update: &Grammar) -> bool {
        let candidate = grammar.merged_with(update);
        let parser = EarleyParser::new(&candidate);
        let mut confirmed: Vec<&String> = self.confirmed.iter().collect();
        confirmed.sort_by_key(|s| s.chars().count());

        let mut timeouts = 0;
        let mut refuted = None;
        for input in self.discriminating.iter().chain(confirmed) {
            match parser.recognize(input, &self.parse_deadline()) {
                Recognition::Accepted => timeouts = 0,
                Recognition::Rejected => {
                    debug!("candidate rejects valid input {:?}", input);
                    refuted = Some(input.clone());
                    break;
                }
                Recognition::Timeout => {
                    timeouts += 1;
                    warn!("parsing {:?} timed out during validation", input);
                    if timeouts >= self.config.stop_after_k_timeouts.max(1) {
                        return true;
                    }
                }
            }
        }
        match refuted {
            Some(input) => {
                self.discriminating.insert(input);
                true
            }
            None => false,
        }
    }
}

/// Merges `update`, collapses duplicate nonterminals and drops what became
/// unreachable.
fn commit(grammar: &Grammar, update: Grammar) -> Grammar {
    let mut refined = grammar.merged_with(&update);
    refined.dedup();
    refined.prune_unreachable(START);
    refined
}
