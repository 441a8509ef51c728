//! Quota & Usage Store.
//!
//! Persisted as a JSON users file, written atomically (temp file +
//! rename) and updated per api_key under one write lock per mutation
//! (see DESIGN.md for the swap from an embedded database to plain JSON).

mod plan;

pub use plan::parse_daily_limit;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub api_key: String,
    pub username: String,
    pub plan: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub daily_tokens_used: u64,
    #[serde(default)]
    pub last_usage_timestamp: i64,
    #[serde(default)]
    pub last_updated_timestamp: i64,
    #[serde(default)]
    pub last_rotation_timestamp: Option<i64>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, User>,
}

#[derive(Debug, Clone)]
pub struct DailyCheck {
    pub ok: bool,
    pub limit: Option<u64>,
    pub used: u64,
}

fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// UTC-calendar-day comparison. A missing/zero timestamp is always a new
/// day.
pub fn is_new_day(ts: i64, now: i64) -> bool {
    if ts <= 0 {
        return true;
    }
    let day_of = |t: i64| -> Option<NaiveDate> { Utc.timestamp_opt(t, 0).single().map(|dt| dt.date_naive()) };
    match (day_of(ts), day_of(now)) {
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

pub struct QuotaStore {
    path: PathBuf,
    users: RwLock<HashMap<String, User>>,
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl QuotaStore {
    pub fn load(path: PathBuf) -> anyhow::Result<Self> {
        let users = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: UsersFile = serde_json::from_str(&raw)?;
            file.users
                .into_iter()
                .map(|(key, mut u)| {
                    u.api_key = key.clone();
                    (key, u)
                })
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            users: RwLock::new(users),
            locks: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    /// O(1) lookup.
    pub fn resolve(&self, api_key: &str) -> Option<User> {
        self.users.read().get(api_key).cloned()
    }

    pub fn insert(&self, user: User) -> anyhow::Result<()> {
        self.users.write().insert(user.api_key.clone(), user);
        self.persist()
    }

    pub fn all(&self) -> Vec<User> {
        self.users.read().values().cloned().collect()
    }

    /// Whether the user has room left under their plan's daily cap.
    pub fn check_daily(&self, user: &User) -> DailyCheck {
        if user.plan.eq_ignore_ascii_case("unlimited") {
            return DailyCheck {
                ok: true,
                limit: None,
                used: user.daily_tokens_used,
            };
        }
        let limit = parse_daily_limit(&user.plan).unwrap_or(0);
        let now = now_unix_seconds();
        let used = if is_new_day(user.last_usage_timestamp, now) {
            0
        } else {
            user.daily_tokens_used
        };
        let ok = !(used >= limit && limit > 0);
        DailyCheck {
            ok,
            limit: Some(limit),
            used,
        }
    }

    async fn lock_for(&self, api_key: &str) -> Arc<Mutex<()>> {
        if let Some(l) = self.locks.read().get(api_key) {
            return Arc::clone(l);
        }
        let mut guard = self.locks.write();
        Arc::clone(
            guard
                .entry(api_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// `adjusted = ceil(tokens * multiplier)`. Persistence failures are
    /// logged and the in-memory counter retained (fail-open).
    pub async fn record_usage(&self, api_key: &str, tokens: u64, multiplier: f64) -> anyhow::Result<u64> {
        let lock = self.lock_for(api_key).await;
        let _guard = lock.lock().await;

        let adjusted = (tokens as f64 * multiplier).ceil() as u64;
        let now = now_unix_seconds();
        {
            let mut users = self.users.write();
            let Some(user) = users.get_mut(api_key) else {
                anyhow::bail!("unknown api_key");
            };
            if is_new_day(user.last_usage_timestamp, now) {
                user.daily_tokens_used = adjusted;
            } else {
                user.daily_tokens_used = user.daily_tokens_used.saturating_add(adjusted);
            }
            user.total_tokens = user.total_tokens.saturating_add(adjusted);
            user.last_usage_timestamp = now;
            user.last_updated_timestamp = now;
        }
        if let Err(err) = self.persist() {
            tracing::error!(error = %err, api_key, "quota persistence failed, in-memory counters retained");
        }
        Ok(adjusted)
    }

    /// Mutate one user record in place, persisting the result. Backs the
    /// `enable`/`disable`/`change_plan` admin actions.
    pub fn update(&self, api_key: &str, f: impl FnOnce(&mut User)) -> anyhow::Result<bool> {
        {
            let mut users = self.users.write();
            let Some(user) = users.get_mut(api_key) else {
                return Ok(false);
            };
            f(user);
            user.last_updated_timestamp = now_unix_seconds();
        }
        self.persist()?;
        Ok(true)
    }

    /// Atomically move a user record to a new key, with everything else
    /// preserved exactly and no grace period for the old key.
    pub fn rename(&self, old_key: &str, new_key: &str) -> anyhow::Result<bool> {
        {
            let mut users = self.users.write();
            let Some(mut user) = users.remove(old_key) else {
                return Ok(false);
            };
            user.api_key = new_key.to_string();
            user.last_rotation_timestamp = Some(now_unix_seconds());
            users.insert(new_key.to_string(), user);
        }
        self.persist()?;
        Ok(true)
    }

    pub fn totals(&self, api_key: &str) -> Option<(u64, u64)> {
        self.users
            .read()
            .get(api_key)
            .map(|u| (u.total_tokens, u.daily_tokens_used))
    }

    /// Atomic write: temp file in the same directory, then rename.
    /// Pretty-printed with 4-space indent.
    fn persist(&self) -> anyhow::Result<()> {
        let users = self.users.read();
        let file = UsersFile {
            users: users.clone(),
        };
        write_atomic(&self.path, &file)
    }
}

fn write_atomic(path: &Path, file: &UsersFile) -> anyhow::Result<()> {
    let pretty = serde_json::to_string_pretty(file)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("users")
    ));
    std::fs::write(&tmp, pretty)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
