//! `GET /v1/usage`: the authenticated key's own cumulative and today's
//! token usage.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::auth::extract_api_key;
use crate::error::AppResult;

use super::state::AppState;

pub async fn handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match run(&state, headers) {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn run(state: &AppState, headers: HeaderMap) -> AppResult<Response> {
    let api_key = extract_api_key(&headers);
    let auth_ctx = state.auth.authenticate(api_key.as_deref())?;

    let (total, daily) = auth_ctx
        .and_then(|ctx| state.quota.totals(&ctx.api_key))
        .unwrap_or((0, 0));

    Ok(Json(json!({
        "total_tokens_processed": total,
        "daily_tokens_processed_today_utc": daily,
        "timestamp_utc": Utc::now().to_rfc3339(),
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::super::router;
    use super::super::test_support::build_state;

    #[tokio::test]
    async fn unauthenticated_bootstrap_mode_reports_zeros() {
        let (state, _dir) = build_state(&serde_json::json!({"endpoints": {}}).to_string(), None);
        let app = router::build(state);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/v1/usage").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["total_tokens_processed"], 0);
    }

    #[tokio::test]
    async fn authenticated_reports_own_totals() {
        let users = serde_json::json!({
            "users": {
                "sk-a": {
                    "username": "alice",
                    "plan": "unlimited",
                    "enabled": true,
                    "total_tokens": 4200,
                    "daily_tokens_used": 100,
                    "last_usage_timestamp": 0,
                    "last_updated_timestamp": 0,
                }
            }
        })
        .to_string();
        let (state, _dir) = build_state(&serde_json::json!({"endpoints": {}}).to_string(), Some(&users));
        let app = router::build(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/usage")
                    .header("authorization", "Bearer sk-a")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["total_tokens_processed"], 4200);
        assert_eq!(body["daily_tokens_processed_today_utc"], 100);
    }
}
