//! Canonical provider/model records.

use serde::{Deserialize, Serialize};

/// How a provider's upstream API key is resolved at forward time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApiKeyRef {
    /// Literal key stored in the catalog record.
    Literal(String),
    /// Name of a process environment variable to resolve at load time.
    EnvVar(String),
    /// Neither configured; the client's own Authorization header is forwarded.
    None,
}

impl ApiKeyRef {
    /// Resolve to the actual key value, if any, reading the process
    /// environment for `EnvVar` refs.
    pub fn resolve(&self) -> Option<String> {
        match self {
            ApiKeyRef::Literal(k) if !k.is_empty() => Some(k.clone()),
            ApiKeyRef::Literal(_) => None,
            ApiKeyRef::EnvVar(name) => std::env::var(name).ok().filter(|v| !v.is_empty()),
            ApiKeyRef::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Error,
    Unknown,
}

impl HealthStatus {
    pub fn score(self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded => 0.7,
            HealthStatus::Unknown => 0.5,
            HealthStatus::Error => 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub status: HealthStatus,
    pub last_checked_unix_ms: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for ProviderHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_checked_unix_ms: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderMetadata {
    #[serde(default)]
    pub is_free: bool,
    #[serde(default)]
    pub premium_model: bool,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub cost_per_token: f64,
    #[serde(default)]
    pub premium_only: bool,
    #[serde(default)]
    pub paid_model: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimits {
    pub rpm: u32,
    pub tpm: u32,
    pub concurrent: u32,
}

/// One upstream endpoint capable of serving one or more logical models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    #[serde(skip)]
    pub api_key_ref: ApiKeyRef,
    pub upstream_model_id: String,
    /// Lower is preferred.
    pub priority: i64,
    pub token_multiplier: f64,
    pub metadata: ProviderMetadata,
    pub rate_limits: RateLimits,
    /// Capacity used by the load balancer.
    pub max_concurrent_requests: u32,
    /// Capability tags used by the decision engine's capability-match score.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Provider {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_ref.resolve()
    }
}

/// A logical client-facing model mapped to an ordered list of providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub logical_id: String,
    pub endpoint_path: String,
    /// Ordered provider names (by catalog insertion order / priority).
    pub providers: Vec<String>,
    pub owner: String,
    pub token_multiplier: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationError {
    pub provider: String,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub valid_providers: usize,
    pub errors: Vec<ValidationError>,
}
