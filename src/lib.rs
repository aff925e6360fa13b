//! # grammar-miner: input grammars from parser execution traces
//!
//! **`grammar-miner`** recovers a context-free grammar for the input language
//! of a program from dynamic traces of its parser, and then refines that
//! grammar against the program until generated inputs are (almost) always
//! accepted.
//!
//! ## Traces
//!
//! A trace is produced by running an instrumented parser on one input. For
//! every input position it records when the position was read, the call stack
//! at each read and the set of values the position could have taken without
//! changing the parser's control flow:
//!
//! ```json
//! {"0": {"readorders": [1],
//!        "executioncontexts": [[{"callee": "main", "callsite": "0x10", "loopiterations": []},
//!                               {"callee": "digit", "callsite": "0x3c", "loopiterations": []}]],
//!        "solutions": [48, 49, 50]}}
//! ```
//!
//! ## Pipeline
//!
//! - **[`trace`]** loads trace files, **[`order`]** repairs the read order
//!   of re-read positions (with help from [`lis`]).
//! - **[`exec_tree`]** turns an ordered trace into an execution tree of
//!   calls, loops and terminal buckets.
//! - **[`extract`]** turns execution trees into grammar rules and collapses
//!   loop encodings.
//! - **[`generalize`]** replaces enumerated token samples by regular
//!   [`patterns`], **[`tidy`]** inlines and factors optionals.
//! - **[`miner`]** and **[`token_miner`]** drive the above for byte-level
//!   and token-level subjects.
//! - **[`refine`]** removes overapproximation by generating inputs with
//!   [`generator`], parsing counterexamples with [`parser`] and asking an
//!   [`oracle`].
//!
//! ## Basic Usage
//!
//! ```rust
//! use grammar_miner::grammar::from_literal;
//! use grammar_miner::oracle::Verdict;
//! use grammar_miner::config::RefinementConfig;
//! use grammar_miner::refine::{Refiner, Termination};
//!
//! // A mined grammar that accepts too much.
//! let grammar = from_literal(&[
//!     ("<start>", &[&["<x>"]]),
//!     ("<x>", &[&["a"], &["b"], &["c"]]),
//! ]);
//!
//! // The subject only accepts "a".
//! let oracle = |input: &str| if input == "a" { Verdict::Accept } else { Verdict::Reject };
//!
//! let config = RefinementConfig { cnt_inputs_refinement: 50, ..RefinementConfig::default() };
//! let report = Refiner::new(&oracle, config).refine(grammar).unwrap();
//! assert_eq!(report.termination, Termination::Converged);
//! assert_eq!(report.grammar.alternatives("<x>").len(), 1);
//! ```
//!
//! Logging goes through the [`log`] facade; the `grammar-miner` binary
//! installs a terminal logger.

pub mod config;
pub mod deadline;
pub mod dot;
pub mod error;
pub mod exec_tree;
pub mod extract;
pub mod generalize;
pub mod generator;
pub mod grammar;
pub mod lis;
pub mod miner;
pub mod oracle;
pub mod order;
pub mod parser;
pub mod patterns;
pub mod refine;
pub mod symbol;
pub mod tidy;
pub mod token_miner;
pub mod trace;
pub mod tree;

pub use error::{Error, Result};
