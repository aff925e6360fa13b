//! Earley parser.
//!
//! [`EarleyParser`] accepts arbitrary context-free grammars, including
//! epsilon alternatives, left recursion and multi-character terminals. The
//! recognizer follows Aycock and Horspool: predicting a nullable nonterminal
//! advances over it at once, so empty completions need no special casing.
//!
//! A successful recognition is turned into a single parse tree by walking the
//! completed items backwards. Ambiguous inputs yield one of their trees.
//!
//! Both phases poll a [`Deadline`]; an expired deadline yields
//! [`ParseOutcome::Timeout`] and leaves the parser reusable.

use std::collections::{HashMap, HashSet};

use log::{trace, warn};

use crate::deadline::{Checkpoint, Deadline};
use crate::grammar::{Grammar, START};
use crate::symbol::Symbol;
use crate::tree::{NodeId, TreeArena};

/// Result of parsing one input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Tree(NodeId),
    NoParse,
    Timeout,
}

/// Result of recognizing one input without building a tree.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recognition {
    Accepted,
    Rejected,
    Timeout,
}

#[derive(Debug, Clone)]
enum FlatSymbol {
    Terminal(Box<[char]>),
    Nonterminal(usize),
}

#[derive(Debug, Clone)]
struct FlatRule {
    lhs: usize,
    rhs: Vec<FlatSymbol>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
struct Item {
    rule: usize,
    dot: usize,
    origin: usize,
}

impl Item {
    fn advance(self) -> Self {
        Item {
            dot: self.dot + 1,
            ..self
        }
    }
}

/// Earley sets for one input.
struct Chart {
    sets: Vec<Vec<Item>>,
    seen: Vec<HashSet<Item>>,
    /// Items waiting on a nonterminal, per set.
    waiting: Vec<HashMap<usize, Vec<Item>>>,
}

impl Chart {
    fn new(len: usize) -> Self {
        Self {
            sets: vec![Vec::new(); len],
            seen: vec![HashSet::new(); len],
            waiting: vec![HashMap::new(); len],
        }
    }
}

pub struct EarleyParser {
    names: Vec<String>,
    index: HashMap<String, usize>,
    rules: Vec<FlatRule>,
    by_lhs: Vec<Vec<usize>>,
    nullable: Vec<bool>,
}

impl EarleyParser {
    pub fn new(grammar: &Grammar) -> Self {
        let mut parser = Self {
            names: Vec::new(),
            index: HashMap::new(),
            rules: Vec::new(),
            by_lhs: Vec::new(),
            nullable: Vec::new(),
        };
        for (nt, alternatives) in grammar.iter() {
            let lhs = parser.intern(nt);
            for rule in alternatives {
                let rhs = rule
                    .iter()
                    .map(|symbol| match symbol {
                        Symbol::Terminal(text) => FlatSymbol::Terminal(text.chars().collect()),
                        Symbol::Nonterminal(name) => FlatSymbol::Nonterminal(parser.intern(name)),
                    })
                    .collect();
                let id = parser.rules.len();
                parser.rules.push(FlatRule { lhs, rhs });
                parser.by_lhs[lhs].push(id);
            }
        }
        parser.nullable = parser.compute_nullable();
        parser
    }

    fn intern(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.names.len();
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), i);
        self.by_lhs.push(Vec::new());
        i
    }

    fn compute_nullable(&self) -> Vec<bool> {
        let mut nullable = vec![false; self.names.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for rule in &self.rules {
                if nullable[rule.lhs] {
                    continue;
                }
                let all = rule.rhs.iter().all(|s| match s {
                    FlatSymbol::Terminal(t) => t.is_empty(),
                    FlatSymbol::Nonterminal(n) => nullable[*n],
                });
                if all {
                    nullable[rule.lhs] = true;
                    changed = true;
                }
            }
        }
        nullable
    }

    /// Does `<start>` derive `input`?
    pub fn recognize(&self, input: &str, deadline: &Deadline) -> Recognition {
        self.recognize_from(START, input, deadline)
    }

    pub fn recognize_from(&self, start: &str, input: &str, deadline: &Deadline) -> Recognition {
        let chars: Vec<char> = input.chars().collect();
        let Some(&start) = self.index.get(start) else {
            return Recognition::Rejected;
        };
        match self.run(&chars, start, deadline) {
            None => Recognition::Timeout,
            Some(chart) if self.accepted(&chart, start, chars.len()) => Recognition::Accepted,
            Some(_) => Recognition::Rejected,
        }
    }

    /// Parses `input` from `<start>`, allocating the tree in `arena`.
    pub fn parse(&self, arena: &mut TreeArena, input: &str, deadline: &Deadline) -> ParseOutcome {
        self.parse_from(arena, START, input, deadline)
    }

    pub fn parse_from(&self, arena: &mut TreeArena, start: &str, input: &str, deadline: &Deadline) -> ParseOutcome {
        let chars: Vec<char> = input.chars().collect();
        let Some(&start) = self.index.get(start) else {
            return ParseOutcome::NoParse;
        };
        let Some(chart) = self.run(&chars, start, deadline) else {
            return ParseOutcome::Timeout;
        };
        if !self.accepted(&chart, start, chars.len()) {
            return ParseOutcome::NoParse;
        }
        let mut extractor = Extractor::new(self, &chars, &chart, deadline);
        match extractor.derive(arena, start, 0, chars.len()) {
            Err(Interrupted) => ParseOutcome::Timeout,
            Ok(Some(root)) => ParseOutcome::Tree(root),
            Ok(None) => {
                warn!("recognized {:?} but could not extract a tree", input);
                ParseOutcome::NoParse
            }
        }
    }

    fn accepted(&self, chart: &Chart, start: usize, end: usize) -> bool {
        chart.sets[end]
            .iter()
            .any(|item| item.origin == 0 && self.rules[item.rule].lhs == start && item.dot == self.rules[item.rule].rhs.len())
    }

    fn next_symbol(&self, item: Item) -> Option<&FlatSymbol> {
        self.rules[item.rule].rhs.get(item.dot)
    }

    fn add(&self, chart: &mut Chart, set: usize, item: Item) {
        if chart.seen[set].insert(item) {
            chart.sets[set].push(item);
            if let Some(FlatSymbol::Nonterminal(b)) = self.next_symbol(item) {
                chart.waiting[set].entry(*b).or_default().push(item);
            }
        }
    }

    /// Builds the chart, or `None` on timeout.
    fn run(&self, input: &[char], start: usize, deadline: &Deadline) -> Option<Chart> {
        let n = input.len();
        let mut chart = Chart::new(n + 1);
        let mut checkpoint = Checkpoint::new(deadline, 1024);
        for &r in &self.by_lhs[start] {
            self.add(&mut chart, 0, Item { rule: r, dot: 0, origin: 0 });
        }
        for j in 0..=n {
            let mut i = 0;
            while i < chart.sets[j].len() {
                if checkpoint.tick() {
                    return None;
                }
                let item = chart.sets[j][i];
                i += 1;
                match self.next_symbol(item) {
                    Some(FlatSymbol::Nonterminal(b)) => {
                        let b = *b;
                        for &r in &self.by_lhs[b] {
                            self.add(&mut chart, j, Item { rule: r, dot: 0, origin: j });
                        }
                        if self.nullable[b] {
                            self.add(&mut chart, j, item.advance());
                        }
                    }
                    Some(FlatSymbol::Terminal(t)) => {
                        if t.is_empty() {
                            self.add(&mut chart, j, item.advance());
                        } else if input[j..].starts_with(t) {
                            self.add(&mut chart, j + t.len(), item.advance());
                        }
                    }
                    None => {
                        let lhs = self.rules[item.rule].lhs;
                        let mut k = 0;
                        while let Some(&waiting) = chart.waiting[item.origin].get(&lhs).and_then(|w| w.get(k)) {
                            k += 1;
                            self.add(&mut chart, j, waiting.advance());
                        }
                    }
                }
            }
        }
        trace!(
            "chart for {} chars: {} items",
            n,
            chart.sets.iter().map(Vec::len).sum::<usize>()
        );
        Some(chart)
    }
}

/// Marker for an expired deadline during tree extraction.
struct Interrupted;

/// A pending subproblem of the tree search.
enum Call {
    /// Some alternative of `nt` spanning `input[from..to]`.
    Derive { nt: usize, from: usize, to: usize },
    /// A split of `input[pos..to]` over `rule.rhs[k..]`.
    Fit { rule: usize, k: usize, pos: usize, to: usize },
}

/// The answer to a [`Call`].
enum Value {
    Tree(Option<NodeId>),
    Children(Option<Vec<NodeId>>),
}

/// A suspended [`Call`] on the explicit work stack.
enum Frame {
    Derive {
        nt: usize,
        from: usize,
        to: usize,
        rules: Vec<usize>,
        next: usize,
    },
    /// `rhs[k]` is a terminal matched at `pos`; waiting on the rest.
    Terminal {
        rule: usize,
        k: usize,
        pos: usize,
        len: usize,
        to: usize,
        hits: usize,
    },
    /// `rhs[k]` is the nonterminal `nt`; tries its completed ends in order.
    Split {
        rule: usize,
        k: usize,
        pos: usize,
        to: usize,
        hits: usize,
        nt: usize,
        ends: Vec<usize>,
        next: usize,
        rest: Option<Vec<NodeId>>,
    },
}

enum Entered {
    Frame(Frame),
    Done(Value),
}

enum Step {
    Call(Call),
    Return(Value),
}

/// Rebuilds one parse tree from the completed items of a chart.
///
/// The search runs on a heap-allocated stack, so derivations as deep as the
/// input is long (right-recursive loops) do not exhaust the thread stack.
struct Extractor<'a> {
    parser: &'a EarleyParser,
    input: &'a [char],
    /// `(nonterminal, start)` to `(end, rule)` of every completed item.
    spans: HashMap<(usize, usize), Vec<(usize, usize)>>,
    active: HashSet<(usize, usize, usize)>,
    failed: HashSet<(usize, usize, usize, usize)>,
    cycle_hits: usize,
    checkpoint: Checkpoint<'a>,
}

impl<'a> Extractor<'a> {
    fn new(parser: &'a EarleyParser, input: &'a [char], chart: &Chart, deadline: &'a Deadline) -> Self {
        let mut spans: HashMap<(usize, usize), Vec<(usize, usize)>> = HashMap::new();
        for (end, set) in chart.sets.iter().enumerate() {
            for item in set {
                let rule = &parser.rules[item.rule];
                if item.dot == rule.rhs.len() {
                    spans.entry((rule.lhs, item.origin)).or_default().push((end, item.rule));
                }
            }
        }
        Self {
            parser,
            input,
            spans,
            active: HashSet::new(),
            failed: HashSet::new(),
            cycle_hits: 0,
            checkpoint: Checkpoint::new(deadline, 1024),
        }
    }

    fn derive(&mut self, arena: &mut TreeArena, nt: usize, from: usize, to: usize) -> Result<Option<NodeId>, Interrupted> {
        let mut stack: Vec<Frame> = Vec::new();
        let mut call = Some(Call::Derive { nt, from, to });
        let mut value = None;
        loop {
            if let Some(call) = call.take() {
                match self.enter(call)? {
                    Entered::Frame(frame) => stack.push(frame),
                    Entered::Done(done) => value = Some(done),
                }
            }
            let Some(frame) = stack.last_mut() else {
                return Ok(match value {
                    Some(Value::Tree(tree)) => tree,
                    _ => None,
                });
            };
            match self.resume(arena, frame, value.take()) {
                Step::Call(next) => call = Some(next),
                Step::Return(done) => {
                    stack.pop();
                    value = Some(done);
                }
            }
        }
    }

    fn enter(&mut self, call: Call) -> Result<Entered, Interrupted> {
        match call {
            Call::Derive { nt, from, to } => {
                if !self.active.insert((nt, from, to)) {
                    self.cycle_hits += 1;
                    return Ok(Entered::Done(Value::Tree(None)));
                }
                let rules = self
                    .spans
                    .get(&(nt, from))
                    .into_iter()
                    .flatten()
                    .filter(|(end, _)| *end == to)
                    .map(|&(_, rule)| rule)
                    .collect();
                Ok(Entered::Frame(Frame::Derive {
                    nt,
                    from,
                    to,
                    rules,
                    next: 0,
                }))
            }
            Call::Fit { rule, k, pos, to } => {
                if self.checkpoint.tick() {
                    return Err(Interrupted);
                }
                let parser = self.parser;
                let rhs = &parser.rules[rule].rhs;
                if k == rhs.len() {
                    return Ok(Entered::Done(Value::Children((pos == to).then(Vec::new))));
                }
                if self.failed.contains(&(rule, k, pos, to)) {
                    return Ok(Entered::Done(Value::Children(None)));
                }
                let hits = self.cycle_hits;
                match &rhs[k] {
                    FlatSymbol::Terminal(t) if self.input[pos..to].starts_with(t) => Ok(Entered::Frame(Frame::Terminal {
                        rule,
                        k,
                        pos,
                        len: t.len(),
                        to,
                        hits,
                    })),
                    FlatSymbol::Terminal(_) => {
                        self.fail(rule, k, pos, to, hits);
                        Ok(Entered::Done(Value::Children(None)))
                    }
                    FlatSymbol::Nonterminal(b) => {
                        let last = k + 1 == rhs.len();
                        let mut ends: Vec<usize> = self
                            .spans
                            .get(&(*b, pos))
                            .into_iter()
                            .flatten()
                            .map(|&(end, _)| end)
                            .filter(|&end| if last { end == to } else { end <= to })
                            .collect();
                        ends.sort_unstable();
                        ends.dedup();
                        Ok(Entered::Frame(Frame::Split {
                            rule,
                            k,
                            pos,
                            to,
                            hits,
                            nt: *b,
                            ends,
                            next: 0,
                            rest: None,
                        }))
                    }
                }
            }
        }
    }

    /// Advances `frame` given the answer to its last call, if any.
    fn resume(&mut self, arena: &mut TreeArena, frame: &mut Frame, value: Option<Value>) -> Step {
        match frame {
            Frame::Derive {
                nt,
                from,
                to,
                rules,
                next,
            } => {
                if let Some(Value::Children(Some(children))) = value {
                    let symbol = Symbol::Nonterminal(self.parser.names[*nt].clone());
                    self.active.remove(&(*nt, *from, *to));
                    return Step::Return(Value::Tree(Some(arena.alloc(symbol, children))));
                }
                match rules.get(*next) {
                    Some(&rule) => {
                        *next += 1;
                        Step::Call(Call::Fit {
                            rule,
                            k: 0,
                            pos: *from,
                            to: *to,
                        })
                    }
                    None => {
                        self.active.remove(&(*nt, *from, *to));
                        Step::Return(Value::Tree(None))
                    }
                }
            }
            &mut Frame::Terminal {
                rule,
                k,
                pos,
                len,
                to,
                hits,
            } => {
                match value {
                    None => Step::Call(Call::Fit {
                        rule,
                        k: k + 1,
                        pos: pos + len,
                        to,
                    }),
                    Some(Value::Children(Some(mut rest))) => {
                        let input = self.input;
                        rest.insert(0, arena.leaf(input[pos..pos + len].iter().collect::<String>()));
                        Step::Return(Value::Children(Some(rest)))
                    }
                    Some(_) => {
                        self.fail(rule, k, pos, to, hits);
                        Step::Return(Value::Children(None))
                    }
                }
            }
            Frame::Split {
                rule,
                k,
                pos,
                to,
                hits,
                nt,
                ends,
                next,
                rest,
            } => {
                match value {
                    Some(Value::Children(Some(children))) => {
                        *rest = Some(children);
                        return Step::Call(Call::Derive {
                            nt: *nt,
                            from: *pos,
                            to: ends[*next - 1],
                        });
                    }
                    Some(Value::Tree(Some(child))) => {
                        let mut children = rest.take().unwrap_or_default();
                        children.insert(0, child);
                        return Step::Return(Value::Children(Some(children)));
                    }
                    _ => {}
                }
                *rest = None;
                match ends.get(*next) {
                    Some(&end) => {
                        *next += 1;
                        Step::Call(Call::Fit {
                            rule: *rule,
                            k: *k + 1,
                            pos: end,
                            to: *to,
                        })
                    }
                    None => {
                        self.fail(*rule, *k, *pos, *to, *hits);
                        Step::Return(Value::Children(None))
                    }
                }
            }
        }
    }

    /// Remembers a dead end unless a cycle cut made it look like one.
    fn fail(&mut self, rule: usize, k: usize, pos: usize, to: usize, hits: usize) {
        if self.cycle_hits == hits {
            self.failed.insert((rule, k, pos, to));
        }
    }
}
