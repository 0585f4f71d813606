//! Error handler center: classify a failure, return the recovery action.
//!
//! The handler mutates nothing: not instances, not the blacklist, not the
//! scheduler. Lookup precedence: custom handler for the code, then the
//! user-configured strategy, then the default table, then surface.

use crate::backoff::Backoff;
use crate::config::RetryPolicyConfig;
use crate::error::{ErrorCode, PipelineError};
use crate::jitter::Jitter;
use crate::strategy::{
    default_strategies, ErrorAction, ErrorHandlingStrategy, StrategyAction,
    DEFAULT_RATE_LIMIT_BLACKLIST,
};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Runtime-registered handler for one error code.
pub type CustomHandler = Arc<dyn Fn(&PipelineError, u32) -> ErrorAction + Send + Sync>;

const FALLBACK_RETRY_DELAY: Duration = Duration::from_millis(500);
const FALLBACK_MAX_DELAY: Duration = Duration::from_secs(30);

/// Stateless decision point (aside from per-code counters).
pub struct ErrorHandlerCenter {
    strategies: ArcSwap<HashMap<ErrorCode, ErrorHandlingStrategy>>,
    custom: ArcSwap<HashMap<ErrorCode, CustomHandler>>,
    counters: Mutex<HashMap<ErrorCode, u64>>,
}

impl ErrorHandlerCenter {
    /// Handler with the shipped default table.
    pub fn new() -> Self {
        Self::with_overrides(Vec::new())
    }

    /// Handler with user strategies merged over the defaults.
    pub fn with_overrides(overrides: Vec<ErrorHandlingStrategy>) -> Self {
        let mut table: HashMap<ErrorCode, ErrorHandlingStrategy> =
            default_strategies().into_iter().map(|s| (s.error_code, s)).collect();
        for strategy in overrides {
            table.insert(strategy.error_code, strategy);
        }
        Self {
            strategies: ArcSwap::from_pointee(table),
            custom: ArcSwap::from_pointee(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Install a custom handler for one code. Safe under live traffic:
    /// readers keep their snapshot, the writer swaps a new map in.
    pub fn register_handler(&self, code: ErrorCode, handler: CustomHandler) {
        self.custom.rcu(|current| {
            let mut next: HashMap<ErrorCode, CustomHandler> = (**current).clone();
            next.insert(code, handler.clone());
            next
        });
    }

    /// Remove a custom handler. Idempotent.
    pub fn unregister_handler(&self, code: ErrorCode) {
        self.custom.rcu(|current| {
            let mut next: HashMap<ErrorCode, CustomHandler> = (**current).clone();
            next.remove(&code);
            next
        });
    }

    /// Replace the strategy for one code at runtime.
    pub fn set_strategy(&self, strategy: ErrorHandlingStrategy) {
        self.strategies.rcu(|current| {
            let mut next: HashMap<ErrorCode, ErrorHandlingStrategy> = (**current).clone();
            next.insert(strategy.error_code, strategy.clone());
            next
        });
    }

    /// Decide what to do about a failure.
    ///
    /// `attempt` is the 1-based number of the attempt that just failed on the
    /// serving instance; `retry_policy` is that instance's configured backoff,
    /// when known.
    pub fn handle(
        &self,
        error: &PipelineError,
        attempt: u32,
        retry_policy: Option<&RetryPolicyConfig>,
    ) -> ErrorAction {
        self.count(error.code());

        let custom = self.custom.load();
        if let Some(handler) = custom.get(&error.code()) {
            let action = handler(error, attempt);
            tracing::debug!(code = %error.code(), ?action, "custom handler decided");
            return action;
        }

        let strategies = self.strategies.load();
        let Some(strategy) = strategies.get(&error.code()) else {
            return ErrorAction::Surface;
        };

        let action = match strategy.action {
            StrategyAction::Retry => {
                let budget = match retry_policy {
                    Some(policy) => strategy.retry_count.min(policy.max_retries),
                    None => strategy.retry_count,
                };
                if attempt <= budget {
                    ErrorAction::Retry { after: self.retry_delay(strategy, attempt, retry_policy) }
                } else {
                    ErrorAction::Failover
                }
            }
            StrategyAction::Failover => ErrorAction::Failover,
            StrategyAction::BlacklistTemporary => {
                // The provider's retry-after wins; the configured duration is
                // the fallback. The blacklist clamps to its own maximum.
                let duration = error.retry_after().unwrap_or_else(|| {
                    strategy.blacklist_duration().unwrap_or(DEFAULT_RATE_LIMIT_BLACKLIST)
                });
                ErrorAction::Blacklist { duration }
            }
            StrategyAction::Maintenance => ErrorAction::Maintenance,
            StrategyAction::DestroyPipeline => ErrorAction::Destroy,
            StrategyAction::Ignore => ErrorAction::Surface,
        };

        tracing::debug!(code = %error.code(), attempt, ?action, "error handled");
        action
    }

    /// Per-code counts since construction.
    pub fn counts(&self) -> HashMap<ErrorCode, u64> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// `min(base * multiplier^attempt + jitter, max_delay)` with
    /// `jitter ∈ [0, delay/2]` when enabled.
    fn retry_delay(
        &self,
        strategy: &ErrorHandlingStrategy,
        attempt: u32,
        retry_policy: Option<&RetryPolicyConfig>,
    ) -> Duration {
        let (base, multiplier, max_delay, jitter_enabled) = match retry_policy {
            Some(policy) => (
                policy.base_delay(),
                policy.backoff_multiplier,
                policy.max_delay(),
                policy.jitter,
            ),
            None => (
                strategy.retry_delay().unwrap_or(FALLBACK_RETRY_DELAY),
                2,
                FALLBACK_MAX_DELAY,
                true,
            ),
        };

        let backoff = Backoff::exponential(base).with_multiplier(multiplier);
        let delay = backoff.delay(attempt as usize);
        let jittered = if jitter_enabled { Jitter::Half.apply(delay) } else { delay };
        jittered.min(max_delay)
    }

    fn count(&self, code: ErrorCode) {
        *self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(code)
            .or_insert(0) += 1;
    }
}

impl Default for ErrorHandlerCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorHandlerCenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandlerCenter")
            .field("strategies", &self.strategies.load().len())
            .field("custom_handlers", &self.custom.load().len())
            .finish()
    }
}
