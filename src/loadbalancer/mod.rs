//! Load Balancer.

mod queue;
mod strategy;

pub use queue::{QueueEntry, RequestQueue};
pub use strategy::Strategy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::traits::{AdmitOutcome, Admitter, HealthView, LoadView};

const DEFAULT_CAPACITY: u32 = 10;
const LOAD_THRESHOLD: f64 = 0.8;
const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_INTERVAL_DEFAULT: Duration = Duration::from_secs(60);

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone)]
pub struct ProviderLoad {
    pub current: u32,
    pub capacity: u32,
    pub last_updated: u64,
}

impl ProviderLoad {
    fn new(capacity: u32) -> Self {
        Self {
            current: 0,
            capacity: capacity.max(1),
            last_updated: now_unix_ms(),
        }
    }

    pub fn utilization(&self) -> f64 {
        self.current as f64 / self.capacity as f64
    }
}

#[derive(Debug, Clone)]
pub struct AdmitResult {
    pub provider: String,
    pub queued: bool,
    pub estimated_wait_ms: Option<u64>,
}

struct ProviderState {
    load: ProviderLoad,
    queue: RequestQueue,
    original_capacity: u32,
}

pub struct LoadBalancer {
    health: Arc<dyn HealthView>,
    states: Mutex<HashMap<String, ProviderState>>,
    strategy: Strategy,
    round_robin_cursor: Mutex<usize>,
    avg_proc_time_ms: u64,
}

impl LoadBalancer {
    pub fn new(health: Arc<dyn HealthView>, strategy: Strategy) -> Self {
        Self {
            health,
            states: Mutex::new(HashMap::new()),
            strategy,
            round_robin_cursor: Mutex::new(0),
            avg_proc_time_ms: 500,
        }
    }

    fn state_for<'a>(
        states: &'a mut HashMap<String, ProviderState>,
        provider: &str,
        capacity: u32,
    ) -> &'a mut ProviderState {
        states.entry(provider.to_string()).or_insert_with(|| ProviderState {
            load: ProviderLoad::new(capacity),
            queue: RequestQueue::new(),
            original_capacity: capacity.max(1),
        })
    }

    pub fn ensure_provider(&self, provider: &str, capacity: u32) {
        let mut states = self.states.lock();
        Self::state_for(&mut states, provider, capacity);
    }

    pub fn load_of(&self, provider: &str) -> Option<ProviderLoad> {
        self.states.lock().get(provider).map(|s| s.load.clone())
    }

    /// Filter to healthy candidates, apply the strategy, else queue.
    pub fn admit(&self, candidates: &[(String, u32)]) -> AdmitResult {
        let mut states = self.states.lock();
        for (name, capacity) in candidates {
            Self::state_for(&mut states, name, *capacity);
        }

        let eligible: Vec<(String, f64)> = candidates
            .iter()
            .filter(|(name, _)| self.health.admits(name))
            .filter_map(|(name, _)| {
                let state = states.get(name)?;
                let util = state.load.utilization();
                (util < LOAD_THRESHOLD).then_some((name.clone(), util))
            })
            .collect();

        if let Some(chosen) = self.pick(&eligible) {
            let state = states.get_mut(&chosen).expect("candidate exists");
            state.load.current += 1;
            state.load.last_updated = now_unix_ms();
            return AdmitResult {
                provider: chosen,
                queued: false,
                estimated_wait_ms: None,
            };
        }

        // None available: enqueue on the provider with the shortest queue.
        let Some((name, _)) = candidates
            .iter()
            .filter(|(name, _)| states.contains_key(name))
            .min_by_key(|(name, _)| states.get(name).map(|s| s.queue.len()).unwrap_or(0))
        else {
            return AdmitResult {
                provider: String::new(),
                queued: true,
                estimated_wait_ms: None,
            };
        };
        let state = states.get_mut(name).expect("candidate exists");
        state.queue.push();
        let wait = state.queue.len() as u64 * self.avg_proc_time_ms;
        AdmitResult {
            provider: name.clone(),
            queued: true,
            estimated_wait_ms: Some(wait),
        }
    }

    fn pick(&self, eligible: &[(String, f64)]) -> Option<String> {
        if eligible.is_empty() {
            return None;
        }
        match self.strategy {
            Strategy::LeastLoad => eligible
                .iter()
                .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(n, _)| n.clone()),
            Strategy::RoundRobin => {
                let mut cursor = self.round_robin_cursor.lock();
                let idx = *cursor % eligible.len();
                *cursor = cursor.wrapping_add(1);
                Some(eligible[idx].0.clone())
            }
            Strategy::Weighted => {
                let weights: Vec<f64> = eligible.iter().map(|(_, u)| (1.0 - u).max(0.1)).collect();
                let total: f64 = weights.iter().sum();
                let mut pick = fastrand::f64() * total;
                for (i, w) in weights.iter().enumerate() {
                    if pick < *w {
                        return Some(eligible[i].0.clone());
                    }
                    pick -= w;
                }
                eligible.last().map(|(n, _)| n.clone())
            }
            Strategy::Random => {
                let idx = fastrand::usize(..eligible.len());
                Some(eligible[idx].0.clone())
            }
        }
    }

    /// Release a concurrency slot, then drain the provider's queue in FIFO
    /// order, dropping entries older than `QUEUE_TIMEOUT`.
    pub fn release(&self, provider: &str) {
        let mut states = self.states.lock();
        let Some(state) = states.get_mut(provider) else {
            return;
        };
        state.load.current = state.load.current.saturating_sub(1);
        state.load.last_updated = now_unix_ms();
        state.queue.drain_expired(QUEUE_TIMEOUT);
        if state.load.current < state.load.capacity {
            if let Some(_entry) = state.queue.pop_front() {
                state.load.current += 1;
            }
        }
    }

    /// Health-check loop body: halve capacity for providers in `error`,
    /// restore healthy providers to their original capacity.
    pub fn run_health_adjustment(&self) {
        let mut states = self.states.lock();
        for (name, state) in states.iter_mut() {
            if self.health.is_error(name) {
                state.load.capacity = (state.load.capacity / 2).max(1);
            } else {
                state.load.capacity = state.original_capacity;
            }
        }
    }

    pub fn spawn_health_check_loop(self: &Arc<Self>, interval: Option<Duration>) -> tokio::task::JoinHandle<()> {
        let lb = Arc::clone(self);
        let interval = interval.unwrap_or(HEALTH_CHECK_INTERVAL_DEFAULT);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                lb.run_health_adjustment();
            }
        })
    }
}

impl Admitter for LoadBalancer {
    fn admit(&self, provider: &str) -> AdmitOutcome {
        let capacity = self
            .states
            .lock()
            .get(provider)
            .map(|s| s.load.original_capacity)
            .unwrap_or(DEFAULT_CAPACITY);
        let result = LoadBalancer::admit(self, &[(provider.to_string(), capacity)]);
        if result.provider != provider {
            AdmitOutcome::Rejected
        } else if result.queued {
            AdmitOutcome::Queued
        } else {
            AdmitOutcome::Admitted
        }
    }

    fn release(&self, provider: &str) {
        LoadBalancer::release(self, provider)
    }
}

impl LoadView for LoadBalancer {
    fn utilization(&self, provider: &str) -> f64 {
        self.states
            .lock()
            .get(provider)
            .map(|s| s.load.utilization())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    struct AllHealthy;
    impl HealthView for AllHealthy {
        fn health_score(&self, _: &str) -> f64 {
            1.0
        }
        fn is_error(&self, _: &str) -> bool {
            false
        }
        fn admits(&self, _: &str) -> bool {
            true
        }
    }

    struct Selective(Map<String, bool>);
    impl HealthView for Selective {
        fn health_score(&self, p: &str) -> f64 {
            if *self.0.get(p).unwrap_or(&true) { 1.0 } else { 0.0 }
        }
        fn is_error(&self, p: &str) -> bool {
            !*self.0.get(p).unwrap_or(&true)
        }
        fn admits(&self, p: &str) -> bool {
            *self.0.get(p).unwrap_or(&true)
        }
    }

    #[test]
    fn admits_under_capacity() {
        let lb = LoadBalancer::new(Arc::new(AllHealthy), Strategy::LeastLoad);
        let result = lb.admit(&[("a".to_string(), 10)]);
        assert!(!result.queued);
        assert_eq!(result.provider, "a");
    }

    #[test]
    fn queues_when_over_threshold() {
        let lb = LoadBalancer::new(Arc::new(AllHealthy), Strategy::LeastLoad);
        lb.ensure_provider("a", 1);
        lb.admit(&[("a".to_string(), 1)]);
        let result = lb.admit(&[("a".to_string(), 1)]);
        assert!(result.queued);
    }

    #[test]
    fn release_never_drops_current_below_zero() {
        let lb = LoadBalancer::new(Arc::new(AllHealthy), Strategy::LeastLoad);
        lb.ensure_provider("a", 5);
        lb.release("a");
        let load = lb.load_of("a").unwrap();
        assert_eq!(load.current, 0);
    }

    #[test]
    fn unhealthy_provider_excluded_from_admission() {
        let mut map = Map::new();
        map.insert("bad".to_string(), false);
        let lb = LoadBalancer::new(Arc::new(Selective(map)), Strategy::LeastLoad);
        let result = lb.admit(&[("bad".to_string(), 10)]);
        assert!(result.queued);
    }

    #[test]
    fn health_adjustment_halves_capacity_on_error() {
        let mut map = Map::new();
        map.insert("a".to_string(), false);
        let lb = LoadBalancer::new(Arc::new(Selective(map)), Strategy::LeastLoad);
        lb.ensure_provider("a", 10);
        lb.run_health_adjustment();
        assert_eq!(lb.load_of("a").unwrap().capacity, 5);
    }

    #[test]
    fn health_adjustment_restores_capacity_when_healthy() {
        let lb = LoadBalancer::new(Arc::new(AllHealthy), Strategy::LeastLoad);
        lb.ensure_provider("a", 10);
        {
            let mut states = lb.states.lock();
            states.get_mut("a").unwrap().load.capacity = 5;
        }
        lb.run_health_adjustment();
        assert_eq!(lb.load_of("a").unwrap().capacity, 10);
    }
}
