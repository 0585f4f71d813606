//! Time-bounded exclusion set for misbehaving pipelines.
//!
//! Entries expire on their own; the blacklist never permanently bars a
//! pipeline. Expired entries are invisible to queries even before the sweeper
//! physically removes them.

use crate::clock::{Clock, MonotonicClock};
use crate::config::BlacklistConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One exclusion record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub pipeline_id: String,
    pub reason: String,
    pub inserted_at_millis: u64,
    pub expires_at_millis: u64,
}

/// Bounded set of `(pipeline, until, reason)` with auto-expiry.
///
/// Lookups take a short mutex; no I/O happens under the lock.
#[derive(Debug, Clone)]
pub struct Blacklist {
    entries: Arc<Mutex<HashMap<String, BlacklistEntry>>>,
    config: BlacklistConfig,
    clock: Arc<dyn Clock>,
}

impl Blacklist {
    pub fn new(config: BlacklistConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BlacklistConfig, clock: Arc<dyn Clock>) -> Self {
        Self { entries: Arc::new(Mutex::new(HashMap::new())), config, clock }
    }

    /// Insert or refresh an exclusion. The duration is clamped to the
    /// configured maximum; at capacity the entry closest to expiry is evicted.
    pub fn add(&self, pipeline_id: &str, duration: Duration, reason: impl Into<String>) {
        let now = self.clock.now_millis();
        let clamped = duration.min(self.config.max_duration());
        let entry = BlacklistEntry {
            pipeline_id: pipeline_id.to_string(),
            reason: reason.into(),
            inserted_at_millis: now,
            expires_at_millis: now.saturating_add(clamped.as_millis().min(u64::MAX as u128) as u64),
        };

        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !entries.contains_key(pipeline_id) && entries.len() >= self.config.max_entries {
            // Evict whichever entry lifts first.
            if let Some(evictee) = entries
                .values()
                .min_by_key(|e| e.expires_at_millis)
                .map(|e| e.pipeline_id.clone())
            {
                entries.remove(&evictee);
            }
        }
        tracing::warn!(
            pipeline = pipeline_id,
            duration_ms = clamped.as_millis() as u64,
            reason = %entry.reason,
            "pipeline blacklisted"
        );
        entries.insert(pipeline_id.to_string(), entry);
    }

    /// Insert with the configured default duration.
    pub fn add_default(&self, pipeline_id: &str, reason: impl Into<String>) {
        self.add(pipeline_id, self.config.default_duration(), reason);
    }

    /// True iff an unexpired entry exists for the pipeline.
    pub fn is_blacklisted(&self, pipeline_id: &str) -> bool {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(pipeline_id)
            .is_some_and(|e| e.expires_at_millis > now)
    }

    /// Explicit lift. Idempotent.
    pub fn remove(&self, pipeline_id: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(pipeline_id);
    }

    /// Drop physically expired entries. Called by the scheduler's sweeper.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.expires_at_millis > now);
        before - entries.len()
    }

    /// Snapshot of unexpired entries.
    pub fn entries(&self) -> Vec<BlacklistEntry> {
        let now = self.clock.now_millis();
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|e| e.expires_at_millis > now)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.config.cleanup_interval()
    }
}
