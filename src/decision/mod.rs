//! Decision Engine.
//!
//! Depends only on the `ModelLookup`/`HealthView`/`LoadView` interfaces,
//! never on concrete `Catalog`/`LoadBalancer` types, so it can be
//! constructed before the components that implement those traits reach
//! their final wiring.

mod cache;

use std::sync::Arc;

use crate::catalog::Provider;
use crate::traits::{HealthView, LoadView, ModelLookup};

pub use cache::DecisionCache;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    pub capability: f64,
    pub health: f64,
    pub load: f64,
    pub plan: f64,
    pub cache: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capability: 0.40,
            health: 0.25,
            load: 0.20,
            plan: 0.10,
            cache: 0.05,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UserContext {
    pub user_id: String,
    pub premium: bool,
    pub free_plan: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionRequest {
    pub endpoint_path: String,
    pub logical_id: String,
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionKind {
    Route,
    CacheHit,
    NoCandidates,
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub kind: DecisionKind,
    pub model: String,
    pub provider: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone)]
struct ScoredCandidate {
    provider: Provider,
    score: f64,
}

/// Free-plan gate: a free user may only use models explicitly marked
/// free, non-premium, seed tier, or cheap enough.
fn free_plan_allows(provider: &Provider) -> bool {
    provider.metadata.is_free
        || !provider.metadata.premium_model
        || provider.metadata.tier.as_deref() == Some("seed")
        || provider.metadata.cost_per_token <= 0.001
}

/// `|required ∩ capabilities| / |required|`; empty `required` is a match.
fn capability_match(required: &[String], capabilities: &[String]) -> f64 {
    if required.is_empty() {
        return 1.0;
    }
    let matched = required.iter().filter(|r| capabilities.contains(r)).count();
    matched as f64 / required.len() as f64
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union_count = a.iter().chain(b.iter()).collect::<std::collections::HashSet<_>>().len();
    if union_count == 0 {
        return 0.0;
    }
    let intersection = a.iter().filter(|x| b.contains(x)).count();
    intersection as f64 / union_count as f64
}

pub struct DecisionEngine {
    catalog: Arc<dyn ModelLookup>,
    health: Arc<dyn HealthView>,
    load: Arc<dyn LoadView>,
    weights: ScoreWeights,
    cache: DecisionCache,
}

impl DecisionEngine {
    pub fn new(
        catalog: Arc<dyn ModelLookup>,
        health: Arc<dyn HealthView>,
        load: Arc<dyn LoadView>,
    ) -> Self {
        Self {
            catalog,
            health,
            load,
            weights: ScoreWeights::default(),
            cache: DecisionCache::new(),
        }
    }

    pub fn with_weights(mut self, weights: ScoreWeights) -> Self {
        self.weights = weights;
        self
    }

    fn candidates(&self, req: &DecisionRequest, ctx: &UserContext) -> Vec<ScoredCandidate> {
        let providers = self.catalog.providers_for(&req.endpoint_path, &req.logical_id);
        let mut scored = Vec::new();
        for provider in providers {
            if self.health.is_error(&provider.name) {
                continue;
            }
            if ctx.free_plan && !free_plan_allows(&provider) {
                continue;
            }
            let capability = capability_match(&req.required_capabilities, &provider.capabilities);
            if capability < 0.7 {
                continue;
            }
            let health = self.health.health_score(&provider.name);
            let utilization = self.load.utilization(&provider.name);
            let load_score = 1.0 - utilization;
            let plan = if (ctx.premium && provider.metadata.premium_model)
                || (ctx.free_plan && provider.metadata.is_free)
            {
                1.0
            } else {
                0.5
            };
            let cache_score = 0.5;
            let total = self.weights.capability * capability
                + self.weights.health * health
                + self.weights.load * load_score
                + self.weights.plan * plan
                + self.weights.cache * cache_score;
            scored.push(ScoredCandidate {
                provider,
                score: total,
            });
        }
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.provider.priority.cmp(&b.provider.priority))
                .then_with(|| {
                    a.provider
                        .metadata
                        .cost_per_token
                        .partial_cmp(&b.provider.metadata.cost_per_token)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.provider.name.cmp(&b.provider.name))
        });
        scored
    }

    /// Score candidates, check the cache, and route to the best match.
    pub fn decide(&self, req: &DecisionRequest, ctx: &UserContext) -> RoutingDecision {
        let cache_key = cache::key_for(req, ctx);
        if let Some(hit) = self.cache.get(cache_key) {
            return RoutingDecision {
                kind: DecisionKind::CacheHit,
                model: req.logical_id.clone(),
                provider: Some(hit),
                confidence: 1.0,
                reasoning: "decision cache hit".to_string(),
                alternatives: Vec::new(),
            };
        }

        let scored = self.candidates(req, ctx);
        let Some(top) = scored.first() else {
            return RoutingDecision {
                kind: DecisionKind::NoCandidates,
                model: req.logical_id.clone(),
                provider: None,
                confidence: 0.0,
                reasoning: "no surviving candidates".to_string(),
                alternatives: Vec::new(),
            };
        };

        self.cache.put(cache_key, top.provider.name.clone());

        let reasoning = match top.score {
            s if s >= 0.85 => "excellent match".to_string(),
            s if s >= 0.65 => "good match".to_string(),
            s if s >= 0.45 => "acceptable match".to_string(),
            _ => "marginal match".to_string(),
        };

        RoutingDecision {
            kind: DecisionKind::Route,
            model: req.logical_id.clone(),
            provider: Some(top.provider.name.clone()),
            confidence: top.score,
            reasoning,
            alternatives: scored.iter().skip(1).take(3).map(|c| c.provider.name.clone()).collect(),
        }
    }

    /// Capability-similarity (Jaccard) > 0.7, excluding `target` and
    /// plan-forbidden models, sorted descending.
    pub fn find_equivalents(&self, target: &str, ctx: &UserContext) -> Vec<String> {
        let models = self.catalog.models();
        let Some(target_entry) = models.iter().find(|m| m.logical_id == target) else {
            return Vec::new();
        };
        let target_caps: Vec<String> = target_entry
            .providers
            .iter()
            .filter_map(|name| self.catalog.provider(name))
            .flat_map(|p| p.capabilities)
            .collect();

        let mut scored: Vec<(String, f64)> = models
            .iter()
            .filter(|m| m.logical_id != target)
            .filter_map(|m| {
                let caps: Vec<String> = m
                    .providers
                    .iter()
                    .filter_map(|name| self.catalog.provider(name))
                    .flat_map(|p| p.capabilities)
                    .collect();
                let sim = jaccard(&target_caps, &caps);
                if sim <= 0.7 {
                    return None;
                }
                let allowed = m.providers.iter().any(|name| {
                    self.catalog
                        .provider(name)
                        .map(|p| !ctx.free_plan || free_plan_allows(&p))
                        .unwrap_or(false)
                });
                allowed.then_some((m.logical_id.clone(), sim))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(id, _)| id).collect()
    }
}
