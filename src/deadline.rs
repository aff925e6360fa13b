//! Cooperative deadlines for long-running parse and generation calls.
//!
//! Long operations poll [`Deadline::expired`] at their checkpoints and bail out
//! with a timeout result. Nothing is interrupted asynchronously, so an
//! abandoned call leaves the parser and the grammar untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared flag that cancels every deadline created from it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: Option<CancellationToken>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn never() -> Self {
        Self::default()
    }

    /// Expires `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            token: None,
        }
    }

    /// Also expire as soon as `token` is cancelled.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn expired(&self) -> bool {
        if let Some(token) = &self.token {
            if token.is_cancelled() {
                return true;
            }
        }
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

/// Amortizes clock reads: polls the deadline only every `period` ticks.
#[derive(Debug)]
pub(crate) struct Checkpoint<'a> {
    deadline: &'a Deadline,
    ticks: u32,
    period: u32,
}

impl<'a> Checkpoint<'a> {
    pub(crate) fn new(deadline: &'a Deadline, period: u32) -> Self {
        Self {
            deadline,
            ticks: 0,
            period: period.max(1),
        }
    }

    /// Returns `true` once the deadline has expired.
    pub(crate) fn tick(&mut self) -> bool {
        self.ticks += 1;
        if self.ticks >= self.period {
            self.ticks = 0;
            self.deadline.expired()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_never_expires() {
        assert!(!Deadline::never().expired());
    }

    #[test]
    fn test_zero_timeout_expires() {
        assert!(Deadline::after(Duration::ZERO).expired());
    }

    #[test]
    fn test_token_cancels() {
        let token = CancellationToken::new();
        let deadline = Deadline::never().with_token(token.clone());
        assert!(!deadline.expired());
        token.cancel();
        assert!(deadline.expired());
    }

    #[test]
    fn test_checkpoint_period() {
        let deadline = Deadline::after(Duration::ZERO);
        let mut checkpoint = Checkpoint::new(&deadline, 3);
        assert!(!checkpoint.tick());
        assert!(!checkpoint.tick());
        assert!(checkpoint.tick());
    }
}
