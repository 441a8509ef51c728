//! `GET /health`: 200 when at least one provider is not in `error`, 503
//! otherwise.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::catalog::HealthStatus;

use super::state::AppState;

pub async fn handler(State(state): State<AppState>) -> Response {
    let summary = state.catalog.health().summary();
    let providers = state.catalog.all_providers();

    let healthy_count = providers
        .iter()
        .filter(|p| {
            summary
                .get(&p.name)
                .map(|h| h.status != HealthStatus::Error)
                .unwrap_or(true)
        })
        .count();

    let status = if providers.is_empty() || healthy_count > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = json!({
        "status": if status == StatusCode::OK { "healthy" } else { "unhealthy" },
        "providers_total": providers.len(),
        "providers_healthy": healthy_count,
    });
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::super::router;
    use super::super::test_support::build_state;

    #[tokio::test]
    async fn empty_catalog_is_healthy() {
        let (state, _dir) = build_state(&serde_json::json!({"endpoints": {}}).to_string(), None);
        let app = router::build(state);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn every_provider_errored_is_unhealthy() {
        let providers = serde_json::json!({
            "endpoints": {
                "/v1/chat/completions": {
                    "models": {
                        "gpt-4": [{
                            "name": "flaky",
                            "base_url": "https://flaky.example.com",
                            "max_concurrent_requests": 1,
                            "rate_limits": {"rpm": 1, "tpm": 1, "concurrent": 1}
                        }]
                    }
                }
            }
        })
        .to_string();
        let (state, _dir) = build_state(&providers, None);
        state.catalog.health().record_failure("flaky", "network_error".to_string());
        state.catalog.health().record_failure("flaky", "network_error".to_string());
        state.catalog.health().record_failure("flaky", "network_error".to_string());
        let app = router::build(state);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
