//! Error type shared by the mining and refinement stages.
//!
//! Only conditions that make a trace file or a grammar unusable are errors.
//! Parse timeouts, crashing subjects and an early end of refinement are
//! ordinary outcomes and are reported through their own result types
//! ([`ParseOutcome`][crate::parser::ParseOutcome], [`Verdict`][crate::oracle::Verdict],
//! [`Termination`][crate::refine::Termination]).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("trace is empty")]
    EmptyTrace,

    #[error("trace positions are not contiguous: position {0} is missing")]
    TraceGap(usize),

    #[error("trace key {0:?} is not a distinct input position")]
    BadPosition(String),

    #[error("position {0} has an empty solution set")]
    EmptySolutions(usize),

    #[error("position {position} has {orders} read orders but {contexts} execution contexts")]
    MismatchedContexts {
        position: usize,
        orders: usize,
        contexts: usize,
    },

    #[error("first input position was never read")]
    UnreadFirstPosition,

    #[error("could not order trace within {0} repair rounds")]
    UnorderableTrace(usize),

    #[error("solution value {0} does not fit into a byte")]
    SolutionOutOfRange(u32),

    #[error("start symbol mismatch: grammar starts with {expected}, trace starts with {found}")]
    StartMismatch { expected: String, found: String },

    #[error("grammar has no <start> nonterminal")]
    MissingStart,

    #[error("undefined nonterminals reachable from <start>: {0:?}")]
    DanglingNonterminals(Vec<String>),

    #[error("nonterminal {0} has duplicate alternatives")]
    DuplicateAlternative(String),

    #[error("nonterminal {0} is undefined")]
    UndefinedNonterminal(String),

    #[error("nonterminal {0} derives no finite string")]
    Unproductive(String),

    #[error("token trace has no token_id")]
    MissingTokenId,

    #[error("token {0} not found in the token grammar")]
    UnknownToken(String),

    #[error("invalid pattern regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("operation interrupted by deadline")]
    Interrupted,

    #[error("could not run program {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
