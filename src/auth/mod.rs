//! Auth & Quota Gate.

mod scope;

pub use scope::scope_allows;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;

use crate::error::{AppError, AppResult};
use crate::quota::{QuotaStore, User};

/// Default rotation window when a user record sets `last_rotation_timestamp`
/// but the deployment hasn't configured its own interval. Not specified by
/// the source; chosen as a conservative 90 days (see DESIGN.md).
const DEFAULT_ROTATION_INTERVAL_SECONDS: i64 = 90 * 24 * 3600;

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(key) = s.strip_prefix("Bearer ") {
                return Some(key.trim().to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
}

pub struct AuthGate {
    quota: Arc<QuotaStore>,
    rotation_interval_seconds: i64,
}

/// Authenticated principal attached to the request context.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key: String,
    pub user: User,
}

impl AuthGate {
    pub fn new(quota: Arc<QuotaStore>) -> Self {
        Self {
            quota,
            rotation_interval_seconds: DEFAULT_ROTATION_INTERVAL_SECONDS,
        }
    }

    pub fn with_rotation_interval_seconds(mut self, seconds: i64) -> Self {
        self.rotation_interval_seconds = seconds;
        self
    }

    /// Returns `None` when the user store is empty (bootstrap mode: the
    /// gate is a no-op). Otherwise runs the ordered checks and returns
    /// the attached context on success.
    pub fn authenticate(&self, api_key: Option<&str>) -> AppResult<Option<AuthContext>> {
        if self.quota.is_empty() {
            return Ok(None);
        }

        let Some(api_key) = api_key else {
            return Err(AppError::ApiKeyMissing);
        };

        let Some(user) = self.quota.resolve(api_key) else {
            return Err(AppError::InvalidApiKey);
        };
        if !user.enabled {
            return Err(AppError::InvalidApiKey);
        }

        let now = now_unix_seconds();
        if let Some(expires_at) = user.expires_at {
            if now > expires_at {
                return Err(AppError::ApiKeyExpired);
            }
        }
        if let Some(last_rotation) = user.last_rotation_timestamp {
            if now - last_rotation > self.rotation_interval_seconds {
                return Err(AppError::ApiKeyRotationRequired);
            }
        }

        let check = self.quota.check_daily(&user);
        if !check.ok {
            return Err(AppError::DailyLimitExceeded {
                limit: check.limit.unwrap_or(0),
                used: check.used,
            });
        }

        Ok(Some(AuthContext {
            api_key: api_key.to_string(),
            user,
        }))
    }

    /// A user with no `scopes` set may call any path; otherwise at least
    /// one pattern must match.
    pub fn check_scope(&self, user: &User, path: &str) -> AppResult<()> {
        match &user.scopes {
            None => Ok(()),
            Some(scopes) if scopes.iter().any(|pattern| scope_allows(pattern, path)) => Ok(()),
            Some(_) => Err(AppError::InsufficientPermissions),
        }
    }
}
