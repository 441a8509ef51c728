//! Router assembly.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use super::state::AppState;
use super::{admin, forward, health, models, transcription, usage};

const MAX_BODY_BYTES: usize = 30 * 1024 * 1024;

pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::handler))
        .route("/v1/models", get(models::handler))
        .route("/v1/usage", get(usage::handler))
        .route("/v1/chat/completions", post(forward::chat_completions))
        .route("/v1/images/generations", post(forward::images_generations))
        .route("/v1/audio/speech", post(forward::audio_speech))
        .route("/v1/audio/transcriptions", post(transcription::handler))
        .route("/v1/responses", post(forward::responses))
        .route("/admin/keys", get(admin::list).post(admin::act))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::super::test_support::build_state;
    use super::*;

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (state, _dir) = build_state(&serde_json::json!({"endpoints": {}}).to_string(), None);
        let app = build(state);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/nonexistent").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn body_over_limit_is_rejected() {
        let (state, _dir) = build_state(&serde_json::json!({"endpoints": {}}).to_string(), None);
        let app = build(state);
        let oversized = vec![b'a'; MAX_BODY_BYTES + 1];
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(oversized))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::PAYLOAD_TOO_LARGE);
    }
}
