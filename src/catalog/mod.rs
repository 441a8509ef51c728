//! Provider catalog.
//!
//! Holds the hot-reloadable provider/model snapshot behind an
//! `arc_swap`-free atomic pointer swap (`parking_lot::RwLock<Arc<...>>`),
//! so readers never block on a writer.

pub mod health;
pub mod load;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

pub use health::HealthTracker;
pub use types::{
    ApiKeyRef, HealthStatus, ModelEntry, Provider, ProviderHealth, ProviderMetadata, RateLimits,
    ValidationError, ValidationResult,
};

#[derive(Debug, Default)]
struct Snapshot {
    providers: std::collections::BTreeMap<String, Provider>,
    models: Vec<ModelEntry>,
}

pub struct Catalog {
    source_path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    last_mtime: RwLock<Option<std::time::SystemTime>>,
    health: HealthTracker,
}

impl Catalog {
    /// Load the catalog from `source_path` (JSON or CSV, by extension).
    /// Logs (does not fail on) per-record normalization warnings.
    pub fn load(source_path: PathBuf) -> anyhow::Result<Self> {
        let loaded = load::load_from_path(&source_path)?;
        for w in &loaded.warnings {
            tracing::warn!(warning = %w, "provider catalog normalization warning");
        }
        let mtime = std::fs::metadata(&source_path).ok().and_then(|m| m.modified().ok());
        Ok(Self {
            source_path,
            snapshot: RwLock::new(Arc::new(Snapshot {
                providers: loaded.providers,
                models: loaded.models,
            })),
            last_mtime: RwLock::new(mtime),
            health: HealthTracker::new(),
        })
    }

    /// Validate every provider record: required fields present, URL
    /// well-formed, positive rate limits and capacity.
    pub fn validate(&self) -> ValidationResult {
        let snap = self.snapshot.read().clone();
        let mut errors = Vec::new();
        for provider in snap.providers.values() {
            let mut field_errors = Vec::new();
            if provider.name.is_empty() {
                field_errors.push("name is empty".to_string());
            }
            if reqwest::Url::parse(&provider.base_url).is_err() {
                field_errors.push(format!("base_url is not a valid URL: {}", provider.base_url));
            }
            if provider.max_concurrent_requests == 0 {
                field_errors.push("max_concurrent_requests must be > 0".to_string());
            }
            if provider.rate_limits.rpm == 0 {
                field_errors.push("rate_limits.rpm must be > 0".to_string());
            }
            if !field_errors.is_empty() {
                errors.push(ValidationError {
                    provider: provider.name.clone(),
                    errors: field_errors,
                });
            }
        }
        ValidationResult {
            is_valid: errors.is_empty(),
            valid_providers: snap.providers.len() - errors.len(),
            errors,
        }
    }

    pub fn provider(&self, name: &str) -> Option<Provider> {
        self.snapshot.read().providers.get(name).cloned()
    }

    pub fn all_providers(&self) -> Vec<Provider> {
        self.snapshot.read().providers.values().cloned().collect()
    }

    pub fn models(&self) -> Vec<ModelEntry> {
        self.snapshot.read().models.clone()
    }

    /// Providers registered for `(endpoint_path, logical_id)`, in catalog
    /// order. Priority ordering is applied later by the decision engine,
    /// not here.
    pub fn providers_for(&self, endpoint_path: &str, logical_id: &str) -> Vec<Provider> {
        let snap = self.snapshot.read();
        let Some(entry) = snap
            .models
            .iter()
            .find(|m| m.endpoint_path == endpoint_path && m.logical_id == logical_id)
        else {
            return Vec::new();
        };
        entry
            .providers
            .iter()
            .filter_map(|name| snap.providers.get(name).cloned())
            .collect()
    }

    /// Sorted view by ascending priority then provider name.
    pub fn providers_sorted(&self, endpoint_path: &str, logical_id: &str) -> Vec<Provider> {
        let mut providers = self.providers_for(endpoint_path, logical_id);
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        providers
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    /// Re-read the source file if its mtime has changed, swapping in a new
    /// snapshot atomically. Returns `true` if a reload happened.
    pub fn reload_if_changed(&self) -> anyhow::Result<bool> {
        let mtime = std::fs::metadata(&self.source_path)?.modified().ok();
        if mtime == *self.last_mtime.read() {
            return Ok(false);
        }
        let loaded = load::load_from_path(&self.source_path)?;
        for w in &loaded.warnings {
            tracing::warn!(warning = %w, "provider catalog normalization warning");
        }
        let known: Vec<String> = loaded.providers.keys().cloned().collect();
        *self.snapshot.write() = Arc::new(Snapshot {
            providers: loaded.providers,
            models: loaded.models,
        });
        *self.last_mtime.write() = mtime;
        self.health.retain(&known);
        tracing::info!(path = %self.source_path.display(), "provider catalog reloaded");
        Ok(true)
    }

    /// Spawn a background task polling for catalog changes every `interval`.
    pub fn spawn_reload_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let catalog = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = catalog.reload_if_changed() {
                    tracing::warn!(error = %err, "catalog reload check failed");
                }
            }
        })
    }
}

impl crate::traits::ModelLookup for Catalog {
    fn providers_for(&self, endpoint_path: &str, logical_id: &str) -> Vec<Provider> {
        Catalog::providers_for(self, endpoint_path, logical_id)
    }

    fn models(&self) -> Vec<ModelEntry> {
        Catalog::models(self)
    }

    fn provider(&self, name: &str) -> Option<Provider> {
        Catalog::provider(self, name)
    }
}

impl crate::traits::HealthView for Catalog {
    fn health_score(&self, provider: &str) -> f64 {
        self.health.get(provider).status.score()
    }

    fn is_error(&self, provider: &str) -> bool {
        self.health.get(provider).status == types::HealthStatus::Error
    }

    fn admits(&self, provider: &str) -> bool {
        matches!(
            self.health.get(provider).status,
            types::HealthStatus::Healthy | types::HealthStatus::Degraded
        )
    }
}
