//! Trace files recorded by the symbolic-execution harness.
//!
//! A trace file is a JSON object keyed by input position (`"0"`, `"1"`, ...).
//! Each position records every time the subject read it: a provenance counter
//! (`readorders`), the call stack at that read (`executioncontexts`), and the
//! byte values the solver proved acceptable there (`solutions`):
//!
//! ```json
//! {
//!   "0": {
//!     "readorders": [3],
//!     "executioncontexts": [[{"callee": "main", "callsite": "0x0", "loopiterations": []}]],
//!     "solutions": [49, 50]
//!   }
//! }
//! ```
//!
//! Call sites and loop headers may be given as strings or numbers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopIteration {
    #[serde(deserialize_with = "de_id")]
    pub loopheader: String,
    pub iterationcount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub callee: String,
    #[serde(deserialize_with = "de_id")]
    pub callsite: String,
    #[serde(default)]
    pub loopiterations: Vec<LoopIteration>,
}

impl Frame {
    pub fn new(callee: impl Into<String>, callsite: impl Into<String>) -> Self {
        Self {
            callee: callee.into(),
            callsite: callsite.into(),
            loopiterations: Vec::new(),
        }
    }

    pub fn with_loop(mut self, loopheader: impl Into<String>, iterationcount: u64) -> Self {
        self.loopiterations.push(LoopIteration {
            loopheader: loopheader.into(),
            iterationcount,
        });
        self
    }
}

/// Call stack at one read, outermost frame first.
pub type ExecutionContext = Vec<Frame>;

/// Everything recorded for one input position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    #[serde(default)]
    pub readorders: Vec<u64>,
    #[serde(default)]
    pub executioncontexts: Vec<ExecutionContext>,
    pub solutions: Vec<u32>,
}

/// A validated trace: one record per position, positions `0..len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    positions: Vec<PositionRecord>,
}

impl Trace {
    /// Validates position keys and per-position invariants.
    pub fn from_records(records: BTreeMap<String, PositionRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::EmptyTrace);
        }
        let mut indexed = BTreeMap::new();
        for (key, record) in records {
            let position: usize = key.trim().parse().map_err(|_| Error::BadPosition(key.clone()))?;
            if indexed.insert(position, record).is_some() {
                return Err(Error::BadPosition(key));
            }
        }
        let mut positions = Vec::with_capacity(indexed.len());
        for (expected, (position, record)) in indexed.into_iter().enumerate() {
            if position != expected {
                return Err(Error::TraceGap(expected));
            }
            if record.readorders.len() != record.executioncontexts.len() {
                return Err(Error::MismatchedContexts {
                    position,
                    orders: record.readorders.len(),
                    contexts: record.executioncontexts.len(),
                });
            }
            if record.solutions.is_empty() {
                return Err(Error::EmptySolutions(position));
            }
            positions.push(record);
        }
        Ok(Self { positions })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let records: BTreeMap<String, PositionRecord> = serde_json::from_str(s)?;
        Self::from_records(records)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let trace = Self::from_json_str(&text)?;
        debug!("loaded trace {} with {} positions", path.display(), trace.len());
        Ok(trace)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[PositionRecord] {
        &self.positions
    }

    pub fn to_json_string(&self) -> Result<String> {
        let records: BTreeMap<String, &PositionRecord> =
            self.positions.iter().enumerate().map(|(i, r)| (i.to_string(), r)).collect();
        Ok(serde_json::to_string_pretty(&records)?)
    }
}

/// Regular files in `dir`, sorted by name so that mining is reproducible.
pub fn trace_files(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Accepts identifiers written either as JSON strings or numbers.
pub(crate) fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(serde_json::Number),
    }
    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    const TRACE: &str = r#"{
        "1": {"readorders": [5], "executioncontexts": [[{"callee": "main", "callsite": 17, "loopiterations": [{"loopheader": "0x4", "iterationcount": 2}]}]], "solutions": [43]},
        "0": {"readorders": [2, 4], "executioncontexts": [[{"callee": "main", "callsite": "0x0", "loopiterations": []}], [{"callee": "main", "callsite": "0x0"}]], "solutions": [49]}
    }"#;

    #[test]
    fn test_parse_trace() {
        let trace = Trace::from_json_str(TRACE).unwrap();
        assert_eq!(trace.len(), 2);
        let first = &trace.positions()[0];
        assert_eq!(first.readorders, vec![2, 4]);
        let second = &trace.positions()[1];
        assert_eq!(second.executioncontexts[0][0].callsite, "17");
        assert_eq!(second.executioncontexts[0][0].loopiterations[0].iterationcount, 2);
    }

    #[test]
    fn test_gap_is_rejected() {
        let text = r#"{"0": {"readorders": [], "executioncontexts": [], "solutions": [1]},
                       "2": {"readorders": [], "executioncontexts": [], "solutions": [1]}}"#;
        assert!(matches!(Trace::from_json_str(text), Err(Error::TraceGap(1))));
    }

    #[test]
    fn test_empty_solutions_rejected() {
        let text = r#"{"0": {"readorders": [1], "executioncontexts": [[]], "solutions": []}}"#;
        assert!(matches!(Trace::from_json_str(text), Err(Error::EmptySolutions(0))));
    }

    #[test]
    fn test_mismatched_contexts_rejected() {
        let text = r#"{"0": {"readorders": [1, 2], "executioncontexts": [[]], "solutions": [1]}}"#;
        assert!(matches!(Trace::from_json_str(text), Err(Error::MismatchedContexts { .. })));
    }

    #[test]
    fn test_empty_and_bad_keys() {
        assert!(matches!(Trace::from_json_str("{}"), Err(Error::EmptyTrace)));
        let text = r#"{"x": {"solutions": [1]}}"#;
        assert!(matches!(Trace::from_json_str(text), Err(Error::BadPosition(_))));
    }

    #[test]
    fn test_duplicate_position_rejected() {
        let text = r#"{"0": {"solutions": [48]}, "1": {"solutions": [49]}, "01": {"solutions": [50]}}"#;
        match Trace::from_json_str(text) {
            Err(Error::BadPosition(key)) => assert_eq!(key, "1"),
            other => panic!("expected a duplicate position error, got {other:?}"),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let trace = Trace::from_json_str(TRACE).unwrap();
        let back = Trace::from_json_str(&trace.to_json_string().unwrap()).unwrap();
        assert_eq!(trace, back);
    }
}
