//! Relay selection for a single operation.
//!
//! [`select`] is a pure function over a snapshot of every registered relay. It never
//! touches shared state, so the manager can call it without holding any lock.
//!
//! Candidates are filtered (circuit, capability, NIPs, minimum score), ranked by score
//! descending, then average response time ascending, then URL, and the first `count` are
//! taken. Relays marked required skip the score filter and are guaranteed a slot. When too
//! few candidates remain, filters are relaxed in a fixed order:
//!
//! 1. drop the minimum score
//! 2. admit relays whose open circuit has waited out its timeout, as trial candidates
//! 3. for `Both` requests only, admit required relays that fail capability or NIP filters

use crate::circuit::{CircuitRecord, CircuitState};
use crate::descriptor::RelayDescriptor;
use crate::error::{ClientError, Result};
use crate::performance::PerformanceRecord;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;

/// Which capability an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Both,
}

/// Constraints for one selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionRequest {
    pub operation: Operation,
    /// Desired number of relays; zero is treated as one
    pub count: usize,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub require_write_support: bool,
    #[serde(default)]
    pub required_nips: BTreeSet<u16>,
}

impl SelectionRequest {
    pub fn new(operation: Operation, count: usize) -> Self {
        Self {
            operation,
            count,
            min_score: None,
            require_write_support: false,
            required_nips: BTreeSet::new(),
        }
    }

    pub fn read(count: usize) -> Self {
        Self::new(Operation::Read, count)
    }

    pub fn write(count: usize) -> Self {
        Self::new(Operation::Write, count)
    }

    pub fn both(count: usize) -> Self {
        Self::new(Operation::Both, count)
    }

    pub fn min_score(mut self, score: f64) -> Self {
        self.min_score = Some(score);
        self
    }

    pub fn require_write_support(mut self) -> Self {
        self.require_write_support = true;
        self
    }

    pub fn nips(mut self, nips: impl IntoIterator<Item = u16>) -> Self {
        self.required_nips = nips.into_iter().collect();
        self
    }
}

/// One relay as seen by the selector.
#[derive(Debug, Clone)]
pub struct RelayCandidate {
    pub descriptor: RelayDescriptor,
    pub circuit: CircuitRecord,
    pub performance: PerformanceRecord,
    /// Circuit is open and its reset timeout has elapsed
    pub trial_eligible: bool,
}

impl RelayCandidate {
    fn url(&self) -> &str {
        &self.descriptor.url
    }

    fn is_closed(&self) -> bool {
        self.circuit.state == CircuitState::Closed
    }

    fn is_capable(&self, request: &SelectionRequest) -> bool {
        let d = &self.descriptor;
        let op_ok = match request.operation {
            Operation::Read => d.supports_read,
            Operation::Write => d.supports_write,
            Operation::Both => d.supports_read && d.supports_write,
        };
        op_ok && (!request.require_write_support || d.supports_write)
    }

    fn has_nips(&self, request: &SelectionRequest) -> bool {
        request
            .required_nips
            .is_subset(&self.descriptor.supported_nips)
    }

    fn meets_min_score(&self, request: &SelectionRequest) -> bool {
        self.descriptor.is_required
            || request
                .min_score
                .is_none_or(|min| self.performance.score >= min)
    }
}

fn rank(a: &RelayCandidate, b: &RelayCandidate) -> Ordering {
    b.performance
        .score
        .total_cmp(&a.performance.score)
        .then_with(|| {
            match (
                a.performance.avg_response_time_ms,
                b.performance.avg_response_time_ms,
            ) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
        .then_with(|| a.url().cmp(b.url()))
}

struct Picker<'a> {
    count: usize,
    chosen: Vec<&'a RelayCandidate>,
}

impl<'a> Picker<'a> {
    fn is_full(&self) -> bool {
        self.chosen.len() >= self.count
    }

    fn contains(&self, candidate: &RelayCandidate) -> bool {
        self.chosen.iter().any(|c| c.url() == candidate.url())
    }

    fn extend(&mut self, tier: impl Iterator<Item = &'a RelayCandidate>) {
        for candidate in tier {
            if self.is_full() {
                break;
            }
            if !self.contains(candidate) {
                self.chosen.push(candidate);
            }
        }
    }
}

/// Choose up to `request.count` relays from `candidates`.
///
/// Deterministic for a given snapshot and request. Fails with
/// [`ClientError::SelectionExhausted`] when nothing is left after every relaxation.
pub fn select(
    candidates: &[RelayCandidate],
    request: &SelectionRequest,
) -> Result<Vec<RelayDescriptor>> {
    let mut ranked: Vec<&RelayCandidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| rank(a, b));

    let mut picker = Picker {
        count: request.count.max(1),
        chosen: Vec::new(),
    };

    // Primary tier, with guaranteed slots for required relays
    let primary: Vec<&RelayCandidate> = ranked
        .iter()
        .copied()
        .filter(|c| {
            c.is_closed() && c.is_capable(request) && c.has_nips(request) && c.meets_min_score(request)
        })
        .collect();
    let required_slots = primary
        .iter()
        .filter(|c| c.descriptor.is_required)
        .count()
        .min(picker.count);
    let mut other_slots = picker.count - required_slots;
    let mut required_taken = 0;
    for candidate in primary {
        if candidate.descriptor.is_required {
            if required_taken < required_slots {
                required_taken += 1;
                picker.chosen.push(candidate);
            }
        } else if other_slots > 0 {
            other_slots -= 1;
            picker.chosen.push(candidate);
        }
    }

    if !picker.is_full() && request.min_score.is_some() {
        debug!("Selection relaxing minimum score");
        picker.extend(
            ranked
                .iter()
                .copied()
                .filter(|c| c.is_closed() && c.is_capable(request) && c.has_nips(request)),
        );
    }

    if !picker.is_full() {
        let before = picker.chosen.len();
        picker.extend(
            ranked
                .iter()
                .copied()
                .filter(|c| c.trial_eligible && c.is_capable(request) && c.has_nips(request)),
        );
        if picker.chosen.len() > before {
            debug!(
                "Selection admitted {} trial relay(s)",
                picker.chosen.len() - before
            );
        }
    }

    if !picker.is_full()
        && request.operation == Operation::Both
        && !request.require_write_support
    {
        picker.extend(ranked.iter().copied().filter(|c| {
            c.descriptor.is_required && (c.is_closed() || c.trial_eligible)
        }));
    }

    if picker.chosen.is_empty() {
        return Err(ClientError::SelectionExhausted);
    }

    Ok(picker
        .chosen
        .into_iter()
        .map(|c| c.descriptor.clone())
        .collect())
}
