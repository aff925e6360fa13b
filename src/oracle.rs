//! Program oracles: does the subject accept an input?
//!
//! Any `Fn(&str) -> Verdict + Sync` is an [`Oracle`], which is what the tests
//! use. [`ProgramOracle`] runs an external program once per input, feeding the
//! input on stdin and reading the verdict from the exit status.
//! [`CachedOracle`] memoizes verdicts of any oracle.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::error::{Error, Result};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Reject,
    /// Crash, signal or timeout. Counted neither as valid nor as invalid.
    Inconclusive,
}

pub trait Oracle: Sync {
    fn classify(&self, input: &str) -> Verdict;

    /// Classifies a batch, optionally on the rayon pool.
    fn classify_all(&self, inputs: &[String], parallel: bool) -> Vec<Verdict> {
        if parallel {
            inputs.par_iter().map(|s| self.classify(s)).collect()
        } else {
            inputs.iter().map(|s| self.classify(s)).collect()
        }
    }
}

impl<F> Oracle for F
where
    F: Fn(&str) -> Verdict + Sync,
{
    fn classify(&self, input: &str) -> Verdict {
        self(input)
    }
}

/// Encodes characters U+0000..=U+00FF as single bytes; anything else is
/// written as UTF-8.
pub fn encode_latin1(input: &str) -> Vec<u8> {
    if input.chars().all(|c| (c as u32) <= 0xFF) {
        input.chars().map(|c| c as u8).collect()
    } else {
        input.as_bytes().to_vec()
    }
}

/// Runs an external program per input.
///
/// Exit status 0 is [`Verdict::Accept`], any other exit code
/// [`Verdict::Reject`]. Termination by a signal, a failure to run and a
/// timeout are [`Verdict::Inconclusive`].
#[derive(Debug, Clone)]
pub struct ProgramOracle {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ProgramOracle {
    /// Checks that `program` exists.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let program = program.into();
        if program.components().count() > 1 && !program.exists() {
            return Err(Error::Spawn {
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                program,
            });
        }
        Ok(Self {
            program,
            args: Vec::new(),
            timeout,
        })
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, input: &str) -> Result<Verdict> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Write from a separate thread so a program that never reads its
        // input cannot block us on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let bytes = encode_latin1(input);
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            })
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if started.elapsed() >= self.timeout => {
                    debug!("{} timed out after {:?}, killing", self.program.display(), self.timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                Ok(None) => thread::sleep(Duration::from_millis(1)),
                Err(source) => {
                    return Err(Error::Spawn {
                        program: self.program.clone(),
                        source,
                    })
                }
            }
        };
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        Ok(match status.map(|s| s.code()) {
            Some(Some(0)) => Verdict::Accept,
            Some(Some(_)) => Verdict::Reject,
            // Killed by a signal, or by us.
            Some(None) | None => Verdict::Inconclusive,
        })
    }
}

impl Oracle for ProgramOracle {
    fn classify(&self, input: &str) -> Verdict {
        match self.run(input) {
            Ok(verdict) => {
                trace!("{:?} -> {:?}", input, verdict);
                verdict
            }
            Err(e) => {
                warn!("{}", e);
                Verdict::Inconclusive
            }
        }
    }
}

/// Memoizes the verdicts of another oracle.
pub struct CachedOracle<O> {
    inner: O,
    cache: Mutex<HashMap<String, Verdict>>,
}

impl<O: Oracle> CachedOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }
}

impl<O: Oracle> Oracle for CachedOracle<O> {
    fn classify(&self, input: &str) -> Verdict {
        if let Some(&verdict) = self.cache.lock().get(input) {
            return verdict;
        }
        let verdict = self.inner.classify(input);
        self.cache.lock().insert(input.to_string(), verdict);
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use test_log::test;

    #[test]
    fn test_closure_oracle() {
        let oracle = |s: &str| if s == "a" { Verdict::Accept } else { Verdict::Reject };
        assert_eq!(oracle.classify("a"), Verdict::Accept);
        let inputs = vec!["a".to_string(), "b".to_string()];
        assert_eq!(oracle.classify_all(&inputs, true), vec![Verdict::Accept, Verdict::Reject]);
    }

    #[test]
    fn test_cached_oracle_calls_once() {
        let calls = AtomicUsize::new(0);
        let oracle = CachedOracle::new(|_: &str| {
            calls.fetch_add(1, Ordering::Relaxed);
            Verdict::Reject
        });
        for _ in 0..5 {
            assert_eq!(oracle.classify("x"), Verdict::Reject);
        }
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(oracle.len(), 1);
    }

    #[test]
    fn test_latin1() {
        assert_eq!(encode_latin1("a\u{e9}"), vec![b'a', 0xE9]);
        assert_eq!(encode_latin1("\u{20ac}"), "\u{20ac}".as_bytes().to_vec());
    }

    #[cfg(unix)]
    #[test]
    fn test_program_oracle_exit_codes() {
        let accept = ProgramOracle::new("true", Duration::from_secs(5)).unwrap();
        assert_eq!(accept.classify("anything"), Verdict::Accept);
        let reject = ProgramOracle::new("false", Duration::from_secs(5)).unwrap();
        assert_eq!(reject.classify("anything"), Verdict::Reject);
    }

    #[cfg(unix)]
    #[test]
    fn test_program_oracle_reads_stdin() {
        let oracle = ProgramOracle::new("grep", Duration::from_secs(5))
            .unwrap()
            .with_args(["-q", "^ok$"]);
        assert_eq!(oracle.classify("ok\n"), Verdict::Accept);
        assert_eq!(oracle.classify("nope\n"), Verdict::Reject);
    }

    #[cfg(unix)]
    #[test]
    fn test_program_oracle_timeout() {
        let oracle = ProgramOracle::new("sleep", Duration::from_millis(50))
            .unwrap()
            .with_args(["5"]);
        assert_eq!(oracle.classify(""), Verdict::Inconclusive);
    }

    #[test]
    fn test_missing_program() {
        assert!(matches!(
            ProgramOracle::new("/definitely/not/here", Duration::from_secs(1)),
            Err(Error::Spawn { .. })
        ));
    }
}
