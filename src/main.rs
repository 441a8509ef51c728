use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use modelgate::auth::AuthGate;
use modelgate::catalog::Catalog;
use modelgate::config::{Cli, SecurityConfig};
use modelgate::decision::DecisionEngine;
use modelgate::fallback::FallbackHandler;
use modelgate::http::{self, AppState};
use modelgate::loadbalancer::{LoadBalancer, Strategy};
use modelgate::proxy::UpstreamClient;
use modelgate::quota::QuotaStore;
use modelgate::ratelimit::RateLimiter;

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        tracing::error!(error = %err, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let catalog = Arc::new(Catalog::load(cli.providers_file.clone())?);
    let validation = catalog.validate();
    if !validation.is_valid {
        for err in &validation.errors {
            tracing::warn!(provider = %err.provider, errors = ?err.errors, "provider catalog validation issue");
        }
    }
    tracing::info!(valid_providers = validation.valid_providers, "provider catalog loaded");

    let quota = Arc::new(QuotaStore::load(cli.users_file.clone())?);
    let rate_limiter = Arc::new(RateLimiter::new());

    let strategy: Strategy = cli
        .load_balance_strategy
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    let load_balancer = Arc::new(LoadBalancer::new(catalog.clone(), strategy));

    let decision = Arc::new(DecisionEngine::new(
        catalog.clone(),
        catalog.clone(),
        load_balancer.clone(),
    ));
    let fallback = Arc::new(FallbackHandler::new(
        catalog.clone(),
        decision.clone(),
        load_balancer.clone(),
    ));
    let auth = Arc::new(AuthGate::new(quota.clone()));
    let security = Arc::new(SecurityConfig::load_overlay(&cli.security_config_file)?);

    catalog.spawn_reload_loop(Duration::from_secs(cli.catalog_reload_interval_seconds));
    load_balancer.spawn_health_check_loop(Some(Duration::from_secs(cli.health_check_interval_seconds)));

    let state = AppState {
        catalog,
        quota,
        rate_limiter,
        decision,
        load_balancer,
        fallback,
        auth,
        upstream: UpstreamClient::new(),
        admin_api_key: cli.admin_api_key.clone(),
        security,
        started_at_unix_ms: now_unix_ms(),
    };

    let app = http::build(state.clone());
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "modelgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// Waits for Ctrl-C; `axum::serve`'s graceful shutdown then stops accepting
/// new connections and waits for in-flight ones to finish on its own. Quota
/// writes are already flushed synchronously on every `record_usage` call, so
/// there is no separate flush step here.
async fn shutdown_signal(_state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received, draining in-flight requests");
}
