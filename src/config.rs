//! Process-level configuration: listen address, admin key, rate-limit
//! defaults, and the security-config JSON overlay.
//!
//! `ListenConfig` started as a two-field pair, generalized here into the
//! gateway's full environment surface.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2715,
        }
    }
}

/// Overlay loaded from the security config file, defaults otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub enable_cors: bool,
    #[serde(default)]
    pub enable_ip_whitelist: bool,
}

impl SecurityConfig {
    pub fn load_overlay(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: SecurityConfig = serde_json::from_str(&raw)?;
        Ok(cfg)
    }
}

/// CLI / environment entry point. `clap`'s `env` feature lets every field
/// be supplied as a flag or the matching environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "modelgate", about = "OpenAI-compatible multi-provider gateway")]
pub struct Cli {
    /// Path to the provider catalog file (CSV or JSON).
    #[arg(long, env = "PROVIDERS_FILE", default_value = "providers.json")]
    pub providers_file: PathBuf,

    /// Path to the users/quota JSON file.
    #[arg(long, env = "USERS_FILE", default_value = "users.json")]
    pub users_file: PathBuf,

    /// Path to the security config overlay JSON file.
    #[arg(long, env = "SECURITY_CONFIG_FILE", default_value = "security.json")]
    pub security_config_file: PathBuf,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 2715)]
    pub port: u16,

    #[arg(long, env = "ADMIN_API_KEY", default_value = "")]
    pub admin_api_key: String,

    /// Seconds between provider-catalog hot-reload checks.
    #[arg(long, env = "CATALOG_RELOAD_INTERVAL_SECONDS", default_value_t = 5)]
    pub catalog_reload_interval_seconds: u64,

    /// Seconds between load-balancer health-check sweeps (default 60s).
    #[arg(long, env = "HEALTH_CHECK_INTERVAL_SECONDS", default_value_t = 60)]
    pub health_check_interval_seconds: u64,

    /// One of `least_load`, `round_robin`, `weighted`, `random`.
    #[arg(long, env = "LOAD_BALANCE_STRATEGY", default_value = "least_load")]
    pub load_balance_strategy: String,
}

impl Cli {
    pub fn listen(&self) -> ListenConfig {
        ListenConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_config_missing_file_is_default() {
        let cfg = SecurityConfig::load_overlay(std::path::Path::new("/nonexistent/path.json"))
            .expect("missing file yields defaults");
        assert!(cfg.allowed_origins.is_empty());
        assert!(!cfg.enable_cors);
    }

    #[test]
    fn security_config_parses_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("security.json");
        std::fs::write(
            &path,
            r#"{"allowed_origins":["https://example.com"],"enable_cors":true}"#,
        )
        .unwrap();
        let cfg = SecurityConfig::load_overlay(&path).unwrap();
        assert_eq!(cfg.allowed_origins, vec!["https://example.com"]);
        assert!(cfg.enable_cors);
        assert!(!cfg.enable_ip_whitelist);
    }
}
