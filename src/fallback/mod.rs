//! Fallback Handler.
//!
//! Each strategy returns an explicit tagged outcome rather than raising an
//! exception, so control flow stays in the type instead of the stack.

use std::sync::Arc;
use std::time::Duration;

use crate::decision::{DecisionEngine, DecisionRequest, UserContext};
use crate::traits::{AdmitOutcome, Admitter, ModelLookup};

const MAX_FALLBACK_ATTEMPTS: usize = 3;
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ProviderUnhealthy,
    ModelUnavailable,
    RateLimitExceeded,
    CapacityExceeded,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    EquivalentModel,
    SimilarProvider,
    DowngradeModel,
    PaidFallback,
    QueueRequest,
}

/// Failure-kind to ordered strategy list.
pub fn strategies_for(kind: FailureKind, premium: bool) -> Vec<Strategy> {
    use Strategy::*;
    let mut list = match kind {
        FailureKind::ProviderUnhealthy => {
            let mut v = vec![EquivalentModel, SimilarProvider];
            if premium {
                v.push(PaidFallback);
            }
            v
        }
        FailureKind::ModelUnavailable => vec![EquivalentModel, SimilarProvider, DowngradeModel],
        FailureKind::RateLimitExceeded => vec![QueueRequest, EquivalentModel],
        FailureKind::CapacityExceeded => vec![QueueRequest, SimilarProvider],
        FailureKind::Other => vec![EquivalentModel, SimilarProvider, QueueRequest],
    };
    list.truncate(MAX_FALLBACK_ATTEMPTS);
    list
}

#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub success: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attempts: usize,
}

pub struct FallbackHandler {
    catalog: Arc<dyn ModelLookup>,
    decision: Arc<DecisionEngine>,
    admitter: Arc<dyn Admitter>,
}

impl FallbackHandler {
    pub fn new(
        catalog: Arc<dyn ModelLookup>,
        decision: Arc<DecisionEngine>,
        admitter: Arc<dyn Admitter>,
    ) -> Self {
        Self {
            catalog,
            decision,
            admitter,
        }
    }

    /// Runs the derived strategy list; first success returns. Each strategy
    /// is expected to complete within `FALLBACK_TIMEOUT`, enforced by the
    /// caller wrapping this in `tokio::time::timeout` at the call site where
    /// a strategy performs actual I/O (the admission check here is
    /// synchronous and CPU-bound, so no `async` boundary is needed inside
    /// this function itself).
    pub fn run(
        &self,
        kind: FailureKind,
        failed_provider: &str,
        req: &DecisionRequest,
        ctx: &UserContext,
    ) -> FallbackOutcome {
        let strategies = strategies_for(kind, ctx.premium);
        for (attempt_index, strategy) in strategies.iter().enumerate() {
            if let Some((provider, model)) = self.try_strategy(*strategy, failed_provider, req, ctx) {
                return FallbackOutcome {
                    success: true,
                    provider: Some(provider),
                    model: Some(model),
                    attempts: attempt_index + 1,
                };
            }
        }
        FallbackOutcome {
            success: false,
            provider: None,
            model: None,
            attempts: strategies.len(),
        }
    }

    fn try_strategy(
        &self,
        strategy: Strategy,
        failed_provider: &str,
        req: &DecisionRequest,
        ctx: &UserContext,
    ) -> Option<(String, String)> {
        match strategy {
            Strategy::EquivalentModel => self.equivalent_model(req, ctx),
            Strategy::SimilarProvider => self.similar_provider(failed_provider, req),
            Strategy::DowngradeModel => self.downgrade_model(req, ctx),
            Strategy::PaidFallback => self.paid_fallback(req, ctx),
            Strategy::QueueRequest => self.queue_request(failed_provider, req),
        }
    }

    fn admit_first(&self, endpoint: &str, model: &str) -> Option<String> {
        let providers = self.catalog.providers_for(endpoint, model);
        for provider in providers {
            if self.admitter.admit(&provider.name) == AdmitOutcome::Admitted {
                return Some(provider.name);
            }
        }
        None
    }

    fn equivalent_model(&self, req: &DecisionRequest, ctx: &UserContext) -> Option<(String, String)> {
        for equivalent in self.decision.find_equivalents(&req.logical_id, ctx) {
            if let Some(provider) = self.admit_first(&req.endpoint_path, &equivalent) {
                return Some((provider, equivalent));
            }
        }
        None
    }

    fn similar_provider(&self, failed_provider: &str, req: &DecisionRequest) -> Option<(String, String)> {
        for model in self.catalog.models() {
            if model.endpoint_path != req.endpoint_path {
                continue;
            }
            for name in &model.providers {
                if name == failed_provider {
                    continue;
                }
                let Some(provider) = self.catalog.provider(name) else {
                    continue;
                };
                let score = capability_overlap(&req.required_capabilities, &provider.capabilities);
                if score > 0.5 && self.admitter.admit(name) == AdmitOutcome::Admitted {
                    return Some((name.clone(), model.logical_id.clone()));
                }
            }
        }
        None
    }

    fn downgrade_model(&self, req: &DecisionRequest, ctx: &UserContext) -> Option<(String, String)> {
        let mut candidates: Vec<(String, String, f64)> = Vec::new();
        for model in self.catalog.models() {
            for name in &model.providers {
                let Some(provider) = self.catalog.provider(name) else {
                    continue;
                };
                if ctx.free_plan && !plan_allows(&provider) {
                    continue;
                }
                let score = capability_overlap(&req.required_capabilities, &provider.capabilities);
                if score > 0.3 {
                    candidates.push((name.clone(), model.logical_id.clone(), score));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        for (name, model_id, _) in candidates {
            if self.admitter.admit(&name) == AdmitOutcome::Admitted {
                return Some((name, model_id));
            }
        }
        None
    }

    fn paid_fallback(&self, req: &DecisionRequest, ctx: &UserContext) -> Option<(String, String)> {
        if !ctx.premium {
            return None;
        }
        for model in self.catalog.models() {
            for name in &model.providers {
                let Some(provider) = self.catalog.provider(name) else {
                    continue;
                };
                if !(provider.metadata.premium_only || provider.metadata.paid_model) {
                    continue;
                }
                let score = capability_overlap(&req.required_capabilities, &provider.capabilities);
                if score > 0.7 && self.admitter.admit(&name) == AdmitOutcome::Admitted {
                    return Some((name.clone(), model.logical_id.clone()));
                }
            }
        }
        None
    }

    fn queue_request(&self, failed_provider: &str, req: &DecisionRequest) -> Option<(String, String)> {
        match self.admitter.admit(failed_provider) {
            AdmitOutcome::Admitted | AdmitOutcome::Queued => {
                Some((failed_provider.to_string(), req.logical_id.clone()))
            }
            AdmitOutcome::Rejected => None,
        }
    }
}

fn capability_overlap(required: &[String], capabilities: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required.iter().filter(|r| capabilities.contains(r)).count();
    matched as f64 / required.len() as f64
}

fn plan_allows(provider: &crate::catalog::Provider) -> bool {
    provider.metadata.is_free
        || !provider.metadata.premium_model
        || provider.metadata.tier.as_deref() == Some("seed")
        || provider.metadata.cost_per_token <= 0.001
}

pub const MAX_ATTEMPTS: usize = MAX_FALLBACK_ATTEMPTS;
pub const TIMEOUT: Duration = FALLBACK_TIMEOUT;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_unhealthy_premium_adds_paid_fallback() {
        let strategies = strategies_for(FailureKind::ProviderUnhealthy, true);
        assert_eq!(
            strategies,
            vec![Strategy::EquivalentModel, Strategy::SimilarProvider, Strategy::PaidFallback]
        );
    }

    #[test]
    fn provider_unhealthy_non_premium_has_no_paid_fallback() {
        let strategies = strategies_for(FailureKind::ProviderUnhealthy, false);
        assert_eq!(strategies, vec![Strategy::EquivalentModel, Strategy::SimilarProvider]);
    }

    #[test]
    fn rate_limit_prefers_queue_first() {
        let strategies = strategies_for(FailureKind::RateLimitExceeded, false);
        assert_eq!(strategies[0], Strategy::QueueRequest);
    }

    #[test]
    fn all_lists_respect_max_attempts() {
        for kind in [
            FailureKind::ProviderUnhealthy,
            FailureKind::ModelUnavailable,
            FailureKind::RateLimitExceeded,
            FailureKind::CapacityExceeded,
            FailureKind::Other,
        ] {
            assert!(strategies_for(kind, true).len() <= MAX_FALLBACK_ATTEMPTS);
        }
    }
}
