//! Translation of reconcile results into scheduling decisions.

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ReconcileError;

/// What the host runtime should do after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
    RequeueWithBackoff,
}

/// Transient errors requeue after their own delay; anything else backs off.
pub fn action_for(result: &Result<(), ReconcileError>) -> Action {
    match result {
        Ok(()) => Action::Done,
        Err(err) => match err.requeue_after() {
            Some(delay) => Action::RequeueAfter(delay),
            None => Action::RequeueWithBackoff,
        },
    }
}

/// Per-key exponential backoff for failing items.
#[derive(Debug, Clone)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: HashMap<String, u32>,
}

impl ItemBackoff {
    pub const DEFAULT_BASE: Duration = Duration::from_millis(5);
    pub const DEFAULT_MAX: Duration = Duration::from_secs(1000);

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    /// Delay before retrying `key`, doubling with every consecutive failure.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let exponent = (*failures).min(31);
        *failures = failures.saturating_add(1);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Reset `key` after a success.
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }
}

impl Default for ItemBackoff {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE, Self::DEFAULT_MAX)
    }
}
