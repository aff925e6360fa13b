//! Trace ordering.
//!
//! A subject may read an input position several times, and reads of later
//! positions may happen before reads of earlier ones (lookahead, re-scans).
//! Grammar extraction needs exactly one read per position, with read orders
//! increasing along the input. [`order_trace`] picks that read:
//!
//! 1. Start from the *last* read of every position. A position without reads
//!    inherits the read of its predecessor, shifted just past it.
//! 2. Compute a longest increasing subsequence of the chosen read orders. If
//!    it misses positions, drop the latest read of the excluded position with
//!    the smallest read order and start over.
//! 3. Positions repaired by either step lose a trailing call frame of an
//!    uninstrumented callee, which did not really perform the read.
//!
//! Finally, an (almost) unconstrained lookahead at the end of the input is
//! dropped, and so is a trailing null byte.

use std::collections::BTreeSet;

use log::debug;

use crate::config::OrderConfig;
use crate::error::{Error, Result};
use crate::lis::longest_increasing_subsequence;
use crate::trace::{ExecutionContext, Trace};

/// Position of a read in the subject's global read sequence.
///
/// Real reads have `offset == 0`. A read synthesized for an unread position
/// sits just after the read it was derived from: same `base`, next `offset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReadOrder {
    pub base: u64,
    pub offset: u32,
}

impl ReadOrder {
    pub fn new(base: u64) -> Self {
        Self { base, offset: 0 }
    }

    fn successor(self) -> Self {
        Self {
            base: self.base,
            offset: self.offset + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedPosition {
    pub order: ReadOrder,
    pub context: ExecutionContext,
    pub solutions: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct OrderedTrace {
    pub positions: Vec<OrderedPosition>,
    /// Positions that took over the read of their predecessor.
    pub inherited: BTreeSet<usize>,
    /// Positions whose latest read was discarded.
    pub popped: BTreeSet<usize>,
}

impl OrderedTrace {
    /// Number of positions repaired by either mechanism.
    pub fn fixed_positions(&self) -> usize {
        self.inherited.union(&self.popped).count()
    }

    pub fn was_fixed(&self) -> bool {
        !self.inherited.is_empty() || !self.popped.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    order: ReadOrder,
    context: ExecutionContext,
}

/// Drops the innermost frame if it belongs to an uninstrumented callee that
/// is not a loop of its own.
pub fn prune_external(context: &ExecutionContext) -> ExecutionContext {
    match context.last() {
        Some(frame) if frame.callee.starts_with("__external_") && !frame.callee.contains("_L_0x") => {
            context[..context.len() - 1].to_vec()
        }
        _ => context.clone(),
    }
}

pub fn order_trace(trace: &Trace, config: &OrderConfig) -> Result<OrderedTrace> {
    let records = trace.positions();
    let n = records.len();
    if n == 0 {
        return Err(Error::EmptyTrace);
    }
    if records[0].readorders.is_empty() {
        return Err(Error::UnreadFirstPosition);
    }

    let mut candidates: Vec<Vec<Candidate>> = records
        .iter()
        .map(|r| {
            r.readorders
                .iter()
                .zip(&r.executioncontexts)
                .map(|(&order, context)| Candidate {
                    order: ReadOrder::new(order),
                    context: context.clone(),
                })
                .collect()
        })
        .collect();

    let mut inherited = BTreeSet::new();
    let mut popped = BTreeSet::new();
    let max_rounds = config.max_repair_rounds_per_position.saturating_mul(n).max(1);
    let mut rounds = 0;
    loop {
        for position in 0..n {
            if candidates[position].is_empty() {
                let Some(previous) = position.checked_sub(1).and_then(|p| candidates[p].last()).cloned() else {
                    return Err(Error::UnorderableTrace(rounds));
                };
                debug!("position {} inherits read {:?} of its predecessor", position, previous.order);
                candidates[position].push(Candidate {
                    order: previous.order.successor(),
                    context: previous.context,
                });
                inherited.insert(position);
            }
        }

        // Every list is non-empty here.
        let orders: Vec<ReadOrder> = candidates.iter().filter_map(|c| c.last()).map(|c| c.order).collect();
        let lis = longest_increasing_subsequence(&orders);
        if lis.len() == n {
            break;
        }

        rounds += 1;
        if rounds > max_rounds {
            return Err(Error::UnorderableTrace(rounds));
        }
        let in_lis: BTreeSet<usize> = lis.into_iter().collect();
        // Position 0 has nobody to inherit from, so its only read is kept;
        // the earliest later read goes instead.
        let poppable = |p: &usize| *p > 0 || candidates[*p].len() > 1;
        let odd = (0..n)
            .filter(|p| !in_lis.contains(p))
            .filter(poppable)
            .min_by_key(|&p| orders[p])
            .or_else(|| (1..n).min_by_key(|&p| orders[p]));
        let Some(odd) = odd else {
            return Err(Error::UnorderableTrace(rounds));
        };
        debug!("position {} is out of order, discarding read {:?}", odd, orders[odd]);
        candidates[odd].pop();
        popped.insert(odd);
    }

    let mut positions = Vec::with_capacity(n);
    for (position, (record, mut options)) in records.iter().zip(candidates).enumerate() {
        let Some(chosen) = options.pop() else {
            return Err(Error::UnorderableTrace(rounds));
        };
        let context = if inherited.contains(&position) || popped.contains(&position) {
            let pruned = prune_external(&chosen.context);
            if pruned != chosen.context {
                debug!("position {}: pruned external frame from call stack", position);
            }
            pruned
        } else {
            chosen.context
        };
        positions.push(OrderedPosition {
            order: chosen.order,
            context,
            solutions: record.solutions.clone(),
        });
    }

    if config.drop_trailing_lookahead {
        if positions.len() > 1 && positions[positions.len() - 1].solutions.len() > config.unconstrained_solution_count {
            debug!("dropping unconstrained lookahead at position {}", positions.len() - 1);
            positions.pop();
        }
        if positions.len() > 1 && positions[positions.len() - 1].solutions == [0] {
            debug!("dropping trailing null byte at position {}", positions.len() - 1);
            positions.pop();
        }
    }

    Ok(OrderedTrace {
        positions,
        inherited,
        popped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use crate::trace::{Frame, PositionRecord};
    use test_log::test;

    fn record(orders: &[u64], callee: &str, solutions: &[u32]) -> PositionRecord {
        PositionRecord {
            readorders: orders.to_vec(),
            executioncontexts: orders.iter().map(|_| vec![Frame::new(callee, "0")]).collect(),
            solutions: solutions.to_vec(),
        }
    }

    fn trace(records: Vec<PositionRecord>) -> Trace {
        let map: BTreeMap<String, PositionRecord> = records.into_iter().enumerate().map(|(i, r)| (i.to_string(), r)).collect();
        Trace::from_records(map).unwrap()
    }

    #[test]
    fn test_in_order_trace_is_unchanged() {
        let t = trace(vec![record(&[1], "a", &[49]), record(&[2], "b", &[50])]);
        let ordered = order_trace(&t, &OrderConfig::default()).unwrap();
        assert!(!ordered.was_fixed());
        assert_eq!(ordered.positions[1].order, ReadOrder::new(2));
        assert_eq!(ordered.positions[1].context[0].callee, "b");
    }

    #[test]
    fn test_reread_is_popped() {
        // Position 0 was re-read after position 1; its earlier read fits.
        let t = trace(vec![record(&[1, 9], "a", &[49]), record(&[5], "b", &[50])]);
        let ordered = order_trace(&t, &OrderConfig::default()).unwrap();
        assert_eq!(ordered.positions[0].order, ReadOrder::new(1));
        assert_eq!(ordered.popped.iter().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(ordered.fixed_positions(), 1);
    }

    #[test]
    fn test_unread_position_inherits_context() {
        let t = trace(vec![record(&[4], "a", &[49]), record(&[], "ignored", &[50]), record(&[7], "c", &[51])]);
        let ordered = order_trace(&t, &OrderConfig::default()).unwrap();
        assert_eq!(ordered.positions[1].order, ReadOrder { base: 4, offset: 1 });
        assert_eq!(ordered.positions[1].context[0].callee, "a");
        assert!(ordered.inherited.contains(&1));
    }

    #[test]
    fn test_first_position_keeps_its_only_read() {
        let t = trace(vec![record(&[4], "a", &[49]), record(&[2], "b", &[50])]);
        let ordered = order_trace(&t, &OrderConfig::default()).unwrap();
        assert_eq!(ordered.positions[1].order, ReadOrder { base: 4, offset: 1 });
        assert!(ordered.popped.contains(&1));
        assert!(ordered.inherited.contains(&1));
    }

    #[test]
    fn test_unread_first_position() {
        let t = trace(vec![record(&[], "a", &[49])]);
        assert!(matches!(order_trace(&t, &OrderConfig::default()), Err(Error::UnreadFirstPosition)));
    }

    #[test]
    fn test_trailing_lookahead_and_null_dropped() {
        let all: Vec<u32> = (1..=40).collect();
        let t = trace(vec![record(&[1], "a", &[49]), record(&[2], "a", &[0]), record(&[3], "a", &all)]);
        let ordered = order_trace(&t, &OrderConfig::default()).unwrap();
        assert_eq!(ordered.positions.len(), 1);

        let config = OrderConfig {
            drop_trailing_lookahead: false,
            ..OrderConfig::default()
        };
        assert_eq!(order_trace(&t, &config).unwrap().positions.len(), 3);
    }

    #[test]
    fn test_single_position_never_dropped() {
        let t = trace(vec![record(&[1], "a", &[0])]);
        assert_eq!(order_trace(&t, &OrderConfig::default()).unwrap().positions.len(), 1);
    }

    #[test]
    fn test_prune_external() {
        let context = vec![Frame::new("main", "0"), Frame::new("__external_getc", "1")];
        assert_eq!(prune_external(&context).len(), 1);
        let looping = vec![Frame::new("main", "0"), Frame::new("__external_x_L_0x10", "1")];
        assert_eq!(prune_external(&looping).len(), 2);
        assert!(prune_external(&Vec::new()).is_empty());
    }

    #[test]
    fn test_external_frame_pruned_only_when_fixed() {
        let mut r1 = record(&[4], "a", &[50]);
        r1.executioncontexts[0].push(Frame::new("__external_peek", "9"));
        let mut r0 = record(&[1, 6], "a", &[49]);
        for context in &mut r0.executioncontexts {
            context.push(Frame::new("__external_peek", "9"));
        }
        let t = trace(vec![r0, r1]);
        let ordered = order_trace(&t, &OrderConfig::default()).unwrap();
        // Position 0 was repaired, position 1 was not.
        assert_eq!(ordered.positions[0].context.len(), 1);
        assert_eq!(ordered.positions[1].context.len(), 2);
    }
}
