//! The parameterized forwarder: one handler body shared by the chat,
//! images, speech, and responses endpoints, distinguished only by a small
//! per-endpoint descriptor.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;

use crate::auth::extract_api_key;
use crate::decision::{DecisionKind, DecisionRequest, UserContext};
use crate::error::{AppError, AppResult};
use crate::fallback::FailureKind;
use crate::proxy::{
    build_forward_target, classify_status, estimate_streaming_tokens, extract_tokens, is_event_stream,
    tap_passthrough, EndpointKind, ForwardRequest, UpstreamFailure,
};
use crate::ratelimit::Limits;

use super::state::AppState;

/// Static per-endpoint configuration: the axis the redesign note calls out
/// (token extraction, streaming eligibility, logical path) collapsed into
/// one small struct rather than five copy-pasted handlers.
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    pub path: &'static str,
    pub kind: EndpointKind,
    pub allows_streaming: bool,
}

pub const CHAT_COMPLETIONS: EndpointDescriptor = EndpointDescriptor {
    path: "/v1/chat/completions",
    kind: EndpointKind::ChatCompletions,
    allows_streaming: true,
};

pub const IMAGES_GENERATIONS: EndpointDescriptor = EndpointDescriptor {
    path: "/v1/images/generations",
    kind: EndpointKind::ImageGenerations,
    allows_streaming: false,
};

pub const AUDIO_SPEECH: EndpointDescriptor = EndpointDescriptor {
    path: "/v1/audio/speech",
    kind: EndpointKind::AudioSpeech,
    allows_streaming: false,
};

pub const RESPONSES: EndpointDescriptor = EndpointDescriptor {
    path: "/v1/responses",
    kind: EndpointKind::Responses,
    allows_streaming: true,
};

fn reason_for(failure: UpstreamFailure) -> &'static str {
    match failure {
        UpstreamFailure::ProviderDenial => "provider_denial",
        UpstreamFailure::RateLimitExceeded => "rate_limit_exceeded",
        UpstreamFailure::TokenLimitExceeded => "token_limit_exceeded",
        UpstreamFailure::NetworkError => "network_error",
        UpstreamFailure::Upstream5xx => "upstream_5xx",
    }
}

fn estimate_request_tokens(body: &Value) -> u32 {
    let chars = body.to_string().chars().count();
    (((chars + 3) / 4).max(1)) as u32
}

/// One attempt's classified outcome, used to decide whether to try the next
/// candidate and what to report if every candidate fails.
enum AttemptOutcome {
    Success(Response),
    Retryable { reason: String, body: Option<Value> },
}

pub async fn forward(
    state: &AppState,
    descriptor: EndpointDescriptor,
    headers: HeaderMap,
    body: Value,
) -> AppResult<Response> {
    let api_key = extract_api_key(&headers);
    let auth_ctx = state.auth.authenticate(api_key.as_deref())?;
    if let Some(ctx) = &auth_ctx {
        state.auth.check_scope(&ctx.user, descriptor.path)?;
    }

    let logical_model = body
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Validation("missing `model` field".to_string()))?
        .to_string();

    let free_plan = auth_ctx.as_ref().map(|c| c.user.plan.trim() == "0").unwrap_or(false);
    let billing_key = auth_ctx.as_ref().map(|c| c.api_key.clone());
    let user_ctx = UserContext {
        user_id: auth_ctx
            .as_ref()
            .map(|c| c.api_key.clone())
            .unwrap_or_else(|| "anonymous".to_string()),
        premium: !free_plan,
        free_plan,
    };

    let decision_req = DecisionRequest {
        endpoint_path: descriptor.path.to_string(),
        logical_id: logical_model.clone(),
        required_capabilities: vec![],
    };
    let decision = state.decision.decide(&decision_req, &user_ctx);
    if decision.kind == DecisionKind::NoCandidates {
        return Err(AppError::ModelNotAvailable(logical_model));
    }

    let mut candidate_names: Vec<String> = decision.provider.into_iter().collect();
    candidate_names.extend(decision.alternatives);

    let stream_requested = descriptor.allows_streaming
        && body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let est_tokens = estimate_request_tokens(&body);
    let mut last_error: Option<(String, Option<Value>)> = None;
    let mut attempted = Vec::new();

    for provider_name in &candidate_names {
        let Some(provider) = state.catalog.provider(provider_name) else {
            continue;
        };
        attempted.push(provider_name.clone());

        let limits = Limits {
            rpm: provider.rate_limits.rpm,
            tpm: provider.rate_limits.tpm,
            concurrent_cap: provider.rate_limits.concurrent,
        };
        if state.rate_limiter.can_admit(provider_name, est_tokens, limits).is_err() {
            continue;
        }
        state
            .load_balancer
            .admit(&[(provider_name.clone(), provider.max_concurrent_requests)]);

        let target = build_forward_target(ForwardRequest {
            provider: &provider,
            request_path: descriptor.path,
            body: body.clone(),
            client_api_key: api_key.as_deref(),
        });

        let outcome = if stream_requested {
            attempt_streaming(state, billing_key.as_deref(), &target, provider.token_multiplier).await
        } else {
            attempt_buffered(state, descriptor.kind, billing_key.as_deref(), &target, provider.token_multiplier).await
        };

        let upstream_rate_limited = matches!(
            &outcome,
            AttemptOutcome::Retryable { reason, .. } if reason == "rate_limit_exceeded"
        );
        state.rate_limiter.record(provider_name, upstream_rate_limited);
        state.load_balancer.release(provider_name);

        match outcome {
            AttemptOutcome::Success(response) => {
                state.catalog.health().record_success(provider_name);
                return Ok(response);
            }
            AttemptOutcome::Retryable { reason, body: err_body } => {
                state.catalog.health().record_failure(provider_name, reason.clone());
                last_error = Some((reason, err_body));
            }
        }
    }

    // Every decided candidate failed; ask the fallback handler for one more
    // option rather than giving up immediately.
    if let Some(failed) = attempted.last().cloned() {
        let outcome = state
            .fallback
            .run(FailureKind::Other, &failed, &decision_req, &user_ctx);
        if outcome.success {
            if let Some(provider_name) = &outcome.provider {
                if let Some(provider) = state.catalog.provider(provider_name) {
                    let target = build_forward_target(ForwardRequest {
                        provider: &provider,
                        request_path: descriptor.path,
                        body: body.clone(),
                        client_api_key: api_key.as_deref(),
                    });
                    let attempt = attempt_buffered(
                        state,
                        descriptor.kind,
                        billing_key.as_deref(),
                        &target,
                        provider.token_multiplier,
                    )
                    .await;
                    state.load_balancer.release(provider_name);
                    if let AttemptOutcome::Success(response) = attempt {
                        state.catalog.health().record_success(provider_name);
                        return Ok(response);
                    }
                }
            }
        }
    }

    let (details, last_body) = last_error.unwrap_or_else(|| ("no candidates attempted".to_string(), None));
    Err(AppError::AllProvidersFailed {
        details,
        last_provider_error_body: last_body,
    })
}

async fn attempt_buffered(
    state: &AppState,
    kind: EndpointKind,
    billing_key: Option<&str>,
    target: &crate::proxy::ForwardTarget,
    token_multiplier: f64,
) -> AttemptOutcome {
    let response = match state
        .upstream
        .post_json(&target.url, &target.body, target.api_key.as_deref(), target.legacy)
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            return AttemptOutcome::Retryable {
                reason: "network_error".to_string(),
                body: Some(serde_json::json!({"message": err.to_string()})),
            }
        }
    };

    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

    if let Some(failure) = classify_status(status, &text) {
        return AttemptOutcome::Retryable {
            reason: reason_for(failure).to_string(),
            body: Some(parsed),
        };
    }
    if !(200..300).contains(&status) {
        return AttemptOutcome::Retryable {
            reason: format!("upstream status {status}"),
            body: Some(parsed),
        };
    }

    let input_chars = match kind {
        EndpointKind::AudioSpeech => target
            .body
            .get("input")
            .and_then(|v| v.as_str())
            .map(|s| s.chars().count())
            .unwrap_or(0),
        _ => target.body.to_string().chars().count(),
    };
    let tokens = extract_tokens(kind, &parsed, input_chars, text.len());
    if let Some(api_key) = billing_key {
        if let Err(err) = state.quota.record_usage(api_key, tokens, token_multiplier).await {
            tracing::warn!(error = %err, "quota record_usage failed");
        }
    }

    let response = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
        .header("content-type", "application/json")
        .body(Body::from(text))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    AttemptOutcome::Success(response)
}

async fn attempt_streaming(
    state: &AppState,
    billing_key: Option<&str>,
    target: &crate::proxy::ForwardTarget,
    token_multiplier: f64,
) -> AttemptOutcome {
    let response = match state
        .upstream
        .post_sse(&target.url, &target.body, target.api_key.as_deref(), target.legacy)
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            return AttemptOutcome::Retryable {
                reason: "network_error".to_string(),
                body: Some(serde_json::json!({"message": err.to_string()})),
            }
        }
    };

    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !is_event_stream(content_type.as_deref()) {
        let text = response.text().await.unwrap_or_default();
        let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        if let Some(failure) = classify_status(status, &text) {
            return AttemptOutcome::Retryable {
                reason: reason_for(failure).to_string(),
                body: Some(parsed),
            };
        }
        let response = Response::builder()
            .status(StatusCode::from_u16(status).unwrap_or(StatusCode::OK))
            .body(Body::from(text))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        return AttemptOutcome::Success(response);
    }
    if let Some(failure) = classify_status(status, "") {
        return AttemptOutcome::Retryable {
            reason: reason_for(failure).to_string(),
            body: None,
        };
    }

    let quota = state.quota.clone();
    let billing_key = billing_key.map(str::to_string);
    let byte_stream = response.bytes_stream();
    let tapped = tap_passthrough(byte_stream, move |accumulated_chars| {
        let Some(api_key) = billing_key.clone() else {
            return;
        };
        let tokens = estimate_streaming_tokens(accumulated_chars);
        let quota = quota.clone();
        tokio::spawn(async move {
            if let Err(err) = quota.record_usage(&api_key, tokens, token_multiplier).await {
                tracing::warn!(error = %err, "quota record_usage failed for streamed response");
            }
        });
    });

    let response = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(tapped))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    AttemptOutcome::Success(response)
}

async fn run(state: AppState, descriptor: EndpointDescriptor, headers: HeaderMap, body: Value) -> Response {
    match forward(&state, descriptor, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

pub async fn chat_completions(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    run(state, CHAT_COMPLETIONS, headers, body).await
}

pub async fn images_generations(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    run(state, IMAGES_GENERATIONS, headers, body).await
}

pub async fn audio_speech(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    run(state, AUDIO_SPEECH, headers, body).await
}

pub async fn responses(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    run(state, RESPONSES, headers, body).await
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::super::router;
    use super::super::test_support::{build_state, spawn_mock_upstream};

    fn providers_json(entries: &[(&str, &str, i64)]) -> String {
        let providers: Vec<serde_json::Value> = entries
            .iter()
            .map(|(name, base_url, priority)| {
                serde_json::json!({
                    "name": name,
                    "base_url": base_url,
                    "priority": priority,
                    "max_concurrent_requests": 5,
                    "rate_limits": {"rpm": 60, "tpm": 100000, "concurrent": 5}
                })
            })
            .collect();
        serde_json::json!({
            "endpoints": {
                "/v1/chat/completions": {
                    "models": {"gpt-4": providers}
                }
            }
        })
        .to_string()
    }

    async fn post_chat(router: axum::Router, body: serde_json::Value) -> (axum::http::StatusCode, serde_json::Value) {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(axum::body::Body::from(body.to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, parsed)
    }

    #[tokio::test]
    async fn happy_path_forwards_to_priority_one_provider() {
        let upstream = spawn_mock_upstream(200, serde_json::json!({"choices": [{"message": {"content": "hi"}}]})).await;
        let (state, _dir) = build_state(&providers_json(&[("only", &upstream, 1)]), None);
        let app = router::build(state);

        let (status, body) = post_chat(app, serde_json::json!({"model": "gpt-4", "messages": []})).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "hi");
    }

    #[tokio::test]
    async fn successful_forward_credits_the_authenticated_user_not_the_provider() {
        let upstream = spawn_mock_upstream(
            200,
            serde_json::json!({"choices": [{"message": {"content": "hi"}}], "usage": {"total_tokens": 42}}),
        )
        .await;
        let users = r#"{"users":{"sk-a":{"username":"alice","plan":"unlimited","enabled":true,"total_tokens":0,"daily_tokens_used":0,"last_usage_timestamp":0,"last_updated_timestamp":0}}}"#;
        let (state, _dir) = build_state(&providers_json(&[("only", &upstream, 1)]), Some(users));
        let quota = state.quota.clone();
        let app = router::build(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk-a")
            .body(axum::body::Body::from(
                serde_json::json!({"model": "gpt-4", "messages": []}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let (total, _daily) = quota.totals("sk-a").expect("user record still present");
        assert_eq!(total, 42);
        assert!(quota.totals("only").is_none());
    }

    #[tokio::test]
    async fn falls_back_past_a_denying_provider_without_surfacing_it() {
        let denied = spawn_mock_upstream(403, serde_json::json!({"error": "nope"})).await;
        let healthy = spawn_mock_upstream(200, serde_json::json!({"choices": [{"message": {"content": "ok"}}]})).await;
        let (state, _dir) = build_state(
            &providers_json(&[("denier", &denied, 1), ("backup", &healthy, 2)]),
            None,
        );
        let app = router::build(state);

        let (status, body) = post_chat(app, serde_json::json!({"model": "gpt-4", "messages": []})).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["choices"][0]["message"]["content"], "ok");
    }

    #[tokio::test]
    async fn all_providers_failing_returns_502_with_details() {
        let failing = spawn_mock_upstream(403, serde_json::json!({"error": "nope"})).await;
        let (state, _dir) = build_state(&providers_json(&[("only", &failing, 1)]), None);
        let app = router::build(state);

        let (status, body) = post_chat(app, serde_json::json!({"model": "gpt-4", "messages": []})).await;
        assert_eq!(status, axum::http::StatusCode::BAD_GATEWAY);
        assert!(body["error"]["details"].is_string());
    }

    fn now_unix_seconds() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    #[tokio::test]
    async fn daily_limit_exceeded_returns_429_without_touching_upstream() {
        let users = format!(
            r#"{{"users":{{"sk-over":{{"username":"alice","plan":"500k","enabled":true,"total_tokens":500000,"daily_tokens_used":500000,"last_usage_timestamp":{now},"last_updated_timestamp":0}}}}}}"#,
            now = now_unix_seconds(),
        );
        let (state, _dir) = build_state(&providers_json(&[("only", "http://127.0.0.1:1", 1)]), Some(&users));
        let app = router::build(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk-over")
            .body(axum::body::Body::from(
                serde_json::json!({"model": "gpt-4", "messages": []}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn audio_speech_bills_only_the_input_field_length() {
        let upstream = spawn_mock_upstream(200, serde_json::json!({})).await;
        let providers = serde_json::json!({
            "endpoints": {
                "/v1/audio/speech": {
                    "models": {
                        "tts-1": [{
                            "name": "only",
                            "base_url": upstream,
                            "priority": 1,
                            "max_concurrent_requests": 5,
                            "rate_limits": {"rpm": 60, "tpm": 100000, "concurrent": 5}
                        }]
                    }
                }
            }
        })
        .to_string();
        let users = r#"{"users":{"sk-a":{"username":"alice","plan":"unlimited","enabled":true,"total_tokens":0,"daily_tokens_used":0,"last_usage_timestamp":0,"last_updated_timestamp":0}}}"#;
        let (state, _dir) = build_state(&providers, Some(users));
        let quota = state.quota.clone();
        let app = router::build(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/audio/speech")
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk-a")
            .body(axum::body::Body::from(
                serde_json::json!({"model": "tts-1", "input": "hello"}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let (total, _daily) = quota.totals("sk-a").expect("user record still present");
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn free_plan_gating_blocks_premium_only_model() {
        let upstream = spawn_mock_upstream(200, serde_json::json!({"choices": []})).await;
        let providers = serde_json::json!({
            "endpoints": {
                "/v1/chat/completions": {
                    "models": {
                        "gpt-4": [{
                            "name": "premium",
                            "base_url": upstream,
                            "priority": 1,
                            "max_concurrent_requests": 5,
                            "metadata": {"premium_model": true, "cost_per_token": 1.0},
                            "rate_limits": {"rpm": 60, "tpm": 100000, "concurrent": 5}
                        }]
                    }
                }
            }
        })
        .to_string();
        let (state, _dir) = build_state(
            &providers,
            Some(
                r#"{"users":{"sk-free":{"username":"bob","plan":"0","enabled":true,"total_tokens":0,"daily_tokens_used":0,"last_usage_timestamp":0,"last_updated_timestamp":0}}}"#,
            ),
        );
        let app = router::build(state);

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .header("authorization", "Bearer sk-free")
            .body(axum::body::Body::from(
                serde_json::json!({"model": "gpt-4", "messages": []}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }
}
