//! 24-hour decision cache.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::{DecisionRequest, UserContext};

const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

/// Hash of `{endpoint, required capabilities, model preferences,
/// user_id-bucket}`. The user is bucketed by premium/free plan rather
/// than raw id, matching the scoring formula's own granularity.
pub fn key_for(req: &DecisionRequest, ctx: &UserContext) -> u64 {
    let mut hasher = DefaultHasher::new();
    req.endpoint_path.hash(&mut hasher);
    req.logical_id.hash(&mut hasher);
    let mut caps = req.required_capabilities.clone();
    caps.sort();
    caps.hash(&mut hasher);
    ctx.premium.hash(&mut hasher);
    ctx.free_plan.hash(&mut hasher);
    hasher.finish()
}

pub struct DecisionCache {
    entries: RwLock<HashMap<u64, (String, Instant)>>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: u64) -> Option<String> {
        let entries = self.entries.read();
        let (provider, inserted_at) = entries.get(&key)?;
        if inserted_at.elapsed() < CACHE_TTL {
            Some(provider.clone())
        } else {
            None
        }
    }

    pub fn put(&self, key: u64, provider: String) {
        self.entries.write().insert(key, (provider, Instant::now()));
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves_within_ttl() {
        let cache = DecisionCache::new();
        cache.put(1, "a".to_string());
        assert_eq!(cache.get(1), Some("a".to_string()));
    }

    #[test]
    fn key_differs_for_different_endpoints() {
        let ctx = UserContext {
            user_id: "u".to_string(),
            premium: false,
            free_plan: false,
        };
        let a = DecisionRequest {
            endpoint_path: "/v1/chat/completions".to_string(),
            logical_id: "gpt-4".to_string(),
            required_capabilities: vec![],
        };
        let b = DecisionRequest {
            endpoint_path: "/v1/images/generations".to_string(),
            ..a.clone()
        };
        assert_ne!(key_for(&a, &ctx), key_for(&b, &ctx));
    }
}
