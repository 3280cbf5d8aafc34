//! Per-log wake signals.
//!
//! Each monitored log has two edge-triggered signals: `new_sth` wakes the
//! ingester early when a fresh tree head arrives, and `new_position`
//! wakes the STH auditor after a verified checkpoint. A `Notify` holds at
//! most one pending permit, so repeated raises coalesce exactly like a
//! one-slot channel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

/// Wake signals for one log.
#[derive(Debug, Clone, Default)]
pub struct LogSignals {
    /// Raised when a new STH is stored for the log.
    pub new_sth: Arc<Notify>,

    /// Raised when the log's verified position advances.
    pub new_position: Arc<Notify>,
}

/// Registry of signals for all monitored logs, built once at startup.
#[derive(Debug, Default)]
pub struct SignalRegistry {
    signals: HashMap<i64, LogSignals>,
}

impl SignalRegistry {
    /// Creates a registry with a signal pair for each log id.
    #[must_use]
    pub fn new(log_ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            signals: log_ids
                .into_iter()
                .map(|id| (id, LogSignals::default()))
                .collect(),
        }
    }

    /// Returns the signals for a log, if it is registered.
    #[must_use]
    pub fn get(&self, log_id: i64) -> Option<&LogSignals> {
        self.signals.get(&log_id)
    }

    /// Wakes the ingester for a log. Unknown logs are ignored.
    pub fn raise_new_sth(&self, log_id: i64) {
        if let Some(signals) = self.signals.get(&log_id) {
            signals.new_sth.notify_one();
        }
    }

    /// Wakes the STH auditor for a log. Unknown logs are ignored.
    pub fn raise_new_position(&self, log_id: i64) {
        if let Some(signals) = self.signals.get(&log_id) {
            signals.new_position.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn raised_signal_wakes_waiter() {
        let registry = SignalRegistry::new([1]);
        let signals = registry.get(1).unwrap().clone();

        registry.raise_new_sth(1);
        // The permit is stored, so a later waiter returns immediately.
        signals.new_sth.notified().await;
    }

    #[test]
    fn unknown_log_is_ignored() {
        let registry = SignalRegistry::new([1]);
        registry.raise_new_sth(99);
        registry.raise_new_position(99);
        assert!(registry.get(99).is_none());
    }
}
