//! Provider health tracking, consumed by the load balancer.
//!
//! A consecutive-failure-and-cooldown state machine generalized from a
//! binary healthy/unhealthy model into a three-state
//! healthy/degraded/error model.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;

use super::types::{HealthStatus, ProviderHealth};

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Consecutive-failure threshold after which a provider is marked `Error`
/// rather than merely `Degraded`.
const ERROR_THRESHOLD: u32 = 3;

#[derive(Debug, Default)]
pub struct HealthTracker {
    state: RwLock<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, provider: &str) -> ProviderHealth {
        self.state
            .read()
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record_success(&self, provider: &str) {
        let mut guard = self.state.write();
        let entry = guard.entry(provider.to_string()).or_default();
        entry.status = HealthStatus::Healthy;
        entry.consecutive_failures = 0;
        entry.last_error = None;
        entry.last_checked_unix_ms = now_unix_ms();
    }

    pub fn record_failure(&self, provider: &str, error: impl Into<String>) {
        let mut guard = self.state.write();
        let entry = guard.entry(provider.to_string()).or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.last_error = Some(error.into());
        entry.last_checked_unix_ms = now_unix_ms();
        entry.status = if entry.consecutive_failures >= ERROR_THRESHOLD {
            HealthStatus::Error
        } else {
            HealthStatus::Degraded
        };
    }

    /// Snapshot of every provider's current health, for the `/health`
    /// endpoint and the decision engine's health-score term.
    pub fn summary(&self) -> HashMap<String, ProviderHealth> {
        self.state.read().clone()
    }

    /// Drop tracked state for providers no longer present after a catalog
    /// reload, so stale names don't accumulate forever.
    pub fn retain(&self, known_providers: &[String]) {
        let mut guard = self.state.write();
        guard.retain(|name, _| known_providers.contains(name));
    }
}
