//! Health-aware load balancer over the instance fleet.
//!
//! The balancer owns the per-instance connection accounting: a connection is
//! taken on selection and given back exactly once per completion, success or
//! failure. Everything it tracks lives behind one short mutex; selection does
//! no I/O.

mod strategies;

use crate::blacklist::Blacklist;
use crate::config::BalancerStrategyKind;
use crate::instance::PipelineInstance;
use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strategies::Candidate;
use uuid::Uuid;

const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Per-instance stats owned by the balancer.
#[derive(Debug, Clone, Default)]
pub struct BalancerStats {
    pub current_connections: usize,
    pub total_selections: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Default)]
struct StatEntry {
    current_connections: usize,
    total_selections: u64,
    successes: u64,
    failures: u64,
    average_response_time_ms: f64,
    smooth_weight: f64,
}

impl StatEntry {
    fn snapshot(&self) -> BalancerStats {
        BalancerStats {
            current_connections: self.current_connections,
            total_selections: self.total_selections,
            successes: self.successes,
            failures: self.failures,
            average_response_time_ms: self.average_response_time_ms,
        }
    }
}

/// Pluggable selection over the usable, non-blacklisted part of the fleet.
///
/// Cheap to clone; clones share the same accounting.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    kind: BalancerStrategyKind,
    stats: Arc<Mutex<HashMap<Uuid, StatEntry>>>,
    cursor: Arc<AtomicUsize>,
}

impl LoadBalancer {
    pub fn new(kind: BalancerStrategyKind) -> Self {
        Self {
            kind,
            stats: Arc::new(Mutex::new(HashMap::new())),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn strategy(&self) -> BalancerStrategyKind {
        self.kind
    }

    /// Pick an instance for the next attempt, or `None` when nothing is
    /// eligible. Eligible means selectable (healthy or degraded, enabled, not
    /// in maintenance), not blacklisted, and under its concurrency cap.
    /// Takes one connection on the chosen instance.
    ///
    /// Candidates are ordered by `(priority, pipeline id, instance id)` before
    /// the strategy runs, so round-robin cycles deterministically.
    pub fn select(
        &self,
        instances: &[Arc<PipelineInstance>],
        blacklist: &Blacklist,
    ) -> Option<Arc<PipelineInstance>> {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut candidates: Vec<Candidate> = Vec::new();
        for (index, instance) in instances.iter().enumerate() {
            if !instance.is_selectable() || blacklist.is_blacklisted(instance.pipeline_id()) {
                continue;
            }
            let entry = stats.entry(instance.instance_id()).or_default();
            // Per-instance concurrency cap, enforced through our counter.
            if let Some(cap) = instance.config().max_concurrent_requests {
                if entry.current_connections >= cap {
                    continue;
                }
            }
            candidates.push(Candidate {
                index,
                instance_id: instance.instance_id(),
                weight: instance.config().weight,
                health: instance.health(),
                current_connections: entry.current_connections,
                average_response_ms: entry.average_response_time_ms,
                smooth_weight: entry.smooth_weight,
            });
        }

        candidates.sort_by(|a, b| {
            let pa = &instances[a.index];
            let pb = &instances[b.index];
            pa.config()
                .priority
                .cmp(&pb.config().priority)
                .then_with(|| pa.pipeline_id().cmp(pb.pipeline_id()))
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        let chosen = match self.kind {
            BalancerStrategyKind::RoundRobin => strategies::round_robin(&candidates, &self.cursor),
            BalancerStrategyKind::Weighted => {
                let picked = strategies::weighted(&mut candidates);
                // Persist the adjusted smooth-WRR accumulators.
                for candidate in &candidates {
                    if let Some(entry) = stats.get_mut(&candidate.instance_id) {
                        entry.smooth_weight = candidate.smooth_weight;
                    }
                }
                picked
            }
            BalancerStrategyKind::LeastConnections => strategies::least_connections(&candidates),
            BalancerStrategyKind::Random => strategies::random(&candidates),
        }?;

        let instance = instances[chosen].clone();
        let entry = stats.entry(instance.instance_id()).or_default();
        entry.current_connections += 1;
        entry.total_selections += 1;
        Some(instance)
    }

    /// Take a connection on an instance outside of `select`: the
    /// retry-same-instance path, where the strategy is bypassed but the
    /// accounting must still balance.
    pub fn reserve(&self, instance_id: Uuid) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = stats.entry(instance_id).or_default();
        entry.current_connections += 1;
        entry.total_selections += 1;
    }

    /// Completion callback: gives the connection back and folds the response
    /// time into the rolling average.
    pub fn record_success(&self, instance_id: Uuid, response_time: Duration) {
        self.complete(instance_id, response_time, true);
    }

    /// Completion callback for failed attempts (including timeouts); the
    /// connection still comes back exactly once.
    pub fn record_failure(&self, instance_id: Uuid, response_time: Duration) {
        self.complete(instance_id, response_time, false);
    }

    /// Give a connection back without recording an outcome. Used when an
    /// attempt is cancelled before it completes.
    pub fn release(&self, instance_id: Uuid) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(entry) = stats.get_mut(&instance_id) {
            entry.current_connections = entry.current_connections.saturating_sub(1);
        }
    }

    /// Side channel for the periodic health probe: refresh the rolling
    /// response time from the instance's own EWMA.
    pub fn update_metrics(&self, instance_id: Uuid, average_response_time: Duration) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = stats.entry(instance_id).or_default();
        entry.average_response_time_ms = average_response_time.as_secs_f64() * 1_000.0;
    }

    /// Drop all accounting for a destroyed instance.
    pub fn forget(&self, instance_id: Uuid) {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&instance_id);
    }

    pub fn current_connections(&self, instance_id: Uuid) -> usize {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&instance_id)
            .map(|e| e.current_connections)
            .unwrap_or(0)
    }

    /// Cloned per-instance stats for observability.
    pub fn stats(&self) -> HashMap<Uuid, BalancerStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(id, entry)| (*id, entry.snapshot()))
            .collect()
    }

    fn complete(&self, instance_id: Uuid, response_time: Duration, success: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = stats.entry(instance_id).or_default();
        entry.current_connections = entry.current_connections.saturating_sub(1);
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        let sample_ms = response_time.as_secs_f64() * 1_000.0;
        entry.average_response_time_ms = if entry.successes + entry.failures == 1 {
            sample_ms
        } else {
            entry.average_response_time_ms
                + RESPONSE_TIME_ALPHA * (sample_ms - entry.average_response_time_ms)
        };
    }
}
