//! Selection algorithms over the filtered candidate set.
//!
//! Each algorithm sees candidates the balancer has already filtered to
//! selectable, non-blacklisted, under-capacity instances; it only decides
//! which one goes next. None of them can return an instance outside the input
//! set.

use crate::instance::Health;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

/// What a strategy sees about one candidate.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    /// Position in the caller's instance slice.
    pub index: usize,
    pub instance_id: Uuid,
    pub weight: u32,
    pub health: Health,
    pub current_connections: usize,
    pub average_response_ms: f64,
    /// Smooth-WRR accumulator, persisted by the balancer between calls.
    pub smooth_weight: f64,
}

impl Candidate {
    /// Configured weight scaled by health and load:
    /// 1.0 healthy / 0.5 degraded, and `max(0.1, 1 - connections/10)`.
    pub fn effective_weight(&self) -> f64 {
        let health_factor = match self.health {
            Health::Healthy => 1.0,
            Health::Degraded => 0.5,
            Health::Unknown | Health::Unhealthy => 0.0,
        };
        let load_factor = (1.0 - self.current_connections as f64 / 10.0).max(0.1);
        self.weight as f64 * health_factor * load_factor
    }
}

/// Cyclic cursor over the candidate set; ties broken by instance id through
/// the caller's deterministic ordering.
pub(crate) fn round_robin(candidates: &[Candidate], cursor: &AtomicUsize) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let position = cursor.fetch_add(1, Ordering::Relaxed);
    Some(candidates[position % candidates.len()].index)
}

/// Smooth weighted round-robin: every candidate accrues its effective weight,
/// the leader wins and pays the total back. Returns `(caller index, candidate
/// position)` so the balancer can persist the adjusted accumulators.
pub(crate) fn weighted(candidates: &mut [Candidate]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let mut total = 0.0;
    for candidate in candidates.iter_mut() {
        candidate.smooth_weight += candidate.effective_weight();
        total += candidate.effective_weight();
    }
    let winner = candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.smooth_weight
                .partial_cmp(&b.smooth_weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.instance_id.cmp(&a.instance_id))
        })
        .map(|(position, _)| position)?;
    candidates[winner].smooth_weight -= total;
    Some(candidates[winner].index)
}

/// Fewest balancer-tracked connections; ties go to the faster instance.
pub(crate) fn least_connections(candidates: &[Candidate]) -> Option<usize> {
    candidates
        .iter()
        .min_by(|a, b| {
            a.current_connections.cmp(&b.current_connections).then_with(|| {
                a.average_response_ms
                    .partial_cmp(&b.average_response_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.instance_id.cmp(&b.instance_id))
            })
        })
        .map(|candidate| candidate.index)
}

/// Uniform choice.
pub(crate) fn random(candidates: &[Candidate]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let position = rand::rng().random_range(0..candidates.len());
    Some(candidates[position].index)
}
