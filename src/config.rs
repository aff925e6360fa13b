//! Tunables for mining, generalization and refinement.
//!
//! Every config struct has a [`Default`] matching the values the tool was
//! evaluated with, and deserializes with `#[serde(default)]`, so a JSON file
//! only needs to name the values it overrides:
//!
//! ```
//! use grammar_miner::config::RefinementConfig;
//!
//! let config: RefinementConfig = serde_json::from_str(r#"{"k_subtrees": 4}"#).unwrap();
//! assert_eq!(config.k_subtrees, 4);
//! assert_eq!(config.k_shortest, 100);
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How call frames are disambiguated when traces are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Merge on the callee alone.
    None,
    /// Merge on callee and the call site of the frame.
    Caller,
    /// Merge on callee and the full call-site path.
    CallPath,
    /// Merge on callee and the last `k` call sites.
    Window(usize),
}

impl Default for ContextMode {
    fn default() -> Self {
        ContextMode::CallPath
    }
}

/// Trace Orderer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    /// Drop an (almost) unconstrained or null-byte read at the last position.
    pub drop_trailing_lookahead: bool,
    /// A solution set larger than this counts as unconstrained.
    pub unconstrained_solution_count: usize,
    /// Safety bound on LIS repair rounds, per input position.
    pub max_repair_rounds_per_position: usize,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            drop_trailing_lookahead: true,
            unconstrained_solution_count: 10,
            max_repair_rounds_per_position: 256,
        }
    }
}

/// Token Generalizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralizeConfig {
    /// Derivations sampled per generalized nonterminal.
    pub samples: usize,
    /// Depth bound for sampling.
    pub max_depth: usize,
    /// Sets of at most this many distinct samples stay literal.
    pub threshold_generalization: usize,
    /// Minimum fraction of samples with a whitespace prefix to add a
    /// leading-whitespace wrapper.
    pub ws_ratio: f64,
    /// Fraction of samples allowed to mismatch a pattern.
    pub allowed_token_mismatch_rate: f64,
    pub seed: u64,
}

impl Default for GeneralizeConfig {
    fn default() -> Self {
        Self {
            samples: 1000,
            max_depth: 10,
            threshold_generalization: 10,
            ws_ratio: 0.05,
            allowed_token_mismatch_rate: 0.05,
            seed: 0,
        }
    }
}

/// Mining pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub context: ContextMode,
    /// Run the Grammar Tidier on the generalized grammar.
    pub simplify: bool,
    /// Write intermediate grammars (raw, loop-fixed, generalized) here.
    pub snapshot_dir: Option<PathBuf>,
    pub order: OrderConfig,
    pub generalize: GeneralizeConfig,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            context: ContextMode::default(),
            simplify: true,
            snapshot_dir: None,
            order: OrderConfig::default(),
            generalize: GeneralizeConfig::default(),
        }
    }
}

/// Overapproximation Refiner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    #[serde(with = "secs")]
    pub parse_timeout: Duration,
    #[serde(with = "secs")]
    pub generation_timeout: Duration,
    /// Consecutive parse timeouts after which validation gives up on a candidate.
    pub stop_after_k_timeouts: usize,
    /// Stop once precision reaches this value.
    pub precision_threshold: f64,
    pub max_refinements: usize,
    #[serde(with = "secs")]
    pub max_refinement_time: Duration,
    /// Number of shortest rejected inputs tried as counterexamples.
    pub k_shortest: usize,
    /// Classified samples per sampling round.
    pub cnt_inputs_refinement: usize,
    /// Keep sampling until at least this many inputs are accepted.
    pub min_count_valid: usize,
    /// Probes per alternative when scoring rule quality.
    pub k_subtrees: usize,
    pub max_depth: usize,
    /// Sampling stops after `cnt_inputs_refinement * factor` generation attempts.
    pub max_sampling_attempts_factor: usize,
    /// Classify samples and probes on the rayon pool.
    pub parallel: bool,
    pub seed: u64,
    /// Write `refined_grammar_<n>.json` here after each accepted refinement.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            parse_timeout: Duration::from_secs(60),
            generation_timeout: Duration::from_secs(1),
            stop_after_k_timeouts: 1,
            precision_threshold: 0.99,
            max_refinements: 100,
            max_refinement_time: Duration::from_secs(60 * 60),
            k_shortest: 100,
            cnt_inputs_refinement: 1000,
            min_count_valid: 1,
            k_subtrees: 10,
            max_depth: 10,
            max_sampling_attempts_factor: 10,
            parallel: true,
            seed: 0,
            snapshot_dir: None,
        }
    }
}

/// Loads a JSON config file.
pub fn load<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(serde_json::from_str(&text)?)
}

/// Durations as (fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
