//! Shared application state: a process-wide set of components held behind
//! reader/writer abstractions and passed explicitly to handlers.

use std::sync::Arc;

use crate::auth::AuthGate;
use crate::catalog::Catalog;
use crate::config::SecurityConfig;
use crate::decision::DecisionEngine;
use crate::fallback::FallbackHandler;
use crate::loadbalancer::LoadBalancer;
use crate::proxy::UpstreamClient;
use crate::quota::QuotaStore;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub quota: Arc<QuotaStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub decision: Arc<DecisionEngine>,
    pub load_balancer: Arc<LoadBalancer>,
    pub fallback: Arc<FallbackHandler>,
    pub auth: Arc<AuthGate>,
    pub upstream: UpstreamClient,
    pub admin_api_key: String,
    pub security: Arc<SecurityConfig>,
    pub started_at_unix_ms: u64,
}
