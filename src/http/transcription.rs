//! `/v1/audio/transcriptions`: multipart upload, 25MB cap, forwarded as
//! multipart to the upstream rather than JSON.

use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::auth::extract_api_key;
use crate::decision::{DecisionKind, DecisionRequest, UserContext};
use crate::error::{AppError, AppResult};
use crate::proxy::{extract_tokens, EndpointKind, UpstreamClient};

use super::state::AppState;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;
const ACCEPTED_CONTENT_TYPES: &[&str] = &["audio/mpeg", "audio/wav", "audio/mp3", "audio/x-wav"];

const PATH: &str = "/v1/audio/transcriptions";

struct AudioFile {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

async fn collect(mut multipart: Multipart) -> AppResult<(Option<String>, Option<AudioFile>)> {
    let mut model = None;
    let mut file = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::Validation(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "model" {
            model = Some(
                field
                    .text()
                    .await
                    .map_err(|err| AppError::Validation(format!("invalid model field: {err}")))?,
            );
            continue;
        }
        if name == "file" {
            let filename = field.file_name().unwrap_or("audio").to_string();
            let content_type = field.content_type().unwrap_or("application/octet-stream").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|err| AppError::Validation(format!("invalid file field: {err}")))?
                .to_vec();
            if bytes.len() > MAX_UPLOAD_BYTES {
                return Err(AppError::Validation("audio upload exceeds 25MB limit".to_string()));
            }
            if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_str()) {
                return Err(AppError::Validation(format!(
                    "unsupported audio content type: {content_type}"
                )));
            }
            file = Some(AudioFile {
                filename,
                content_type,
                bytes,
            });
        }
    }
    Ok((model, file))
}

pub async fn handler(State(state): State<AppState>, headers: HeaderMap, multipart: Multipart) -> Response {
    match run(&state, headers, multipart).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn run(state: &AppState, headers: HeaderMap, multipart: Multipart) -> AppResult<Response> {
    let api_key = extract_api_key(&headers);
    let auth_ctx = state.auth.authenticate(api_key.as_deref())?;
    if let Some(ctx) = &auth_ctx {
        state.auth.check_scope(&ctx.user, PATH)?;
    }

    let (model, file) = collect(multipart).await?;
    let model = model.ok_or_else(|| AppError::Validation("missing `model` field".to_string()))?;
    let file = file.ok_or_else(|| AppError::Validation("missing `file` field".to_string()))?;

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
        endpoint_path: PATH.to_string(),
        logical_id: model.clone(),
        required_capabilities: vec![],
    };
    let decision = state.decision.decide(&decision_req, &user_ctx);
    if decision.kind == DecisionKind::NoCandidates {
        return Err(AppError::ModelNotAvailable(model));
    }

    let mut candidates: Vec<String> = decision.provider.into_iter().collect();
    candidates.extend(decision.alternatives);

    let mut last_error = None;
    for provider_name in &candidates {
        let Some(provider) = state.catalog.provider(provider_name) else {
            continue;
        };
        let url = UpstreamClient::build_upstream_url(&provider.base_url, PATH);
        let legacy = provider.base_url.contains("/api/openai");
        let api_key_to_use = provider.api_key().or_else(|| api_key.clone());

        let part = reqwest::multipart::Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)
            .unwrap_or_else(|_| reqwest::multipart::Part::bytes(file.bytes.clone()));
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", provider.upstream_model_id.clone());

        let response = match state.upstream.post_multipart(&url, form, api_key_to_use.as_deref(), legacy).await {
            Ok(resp) => resp,
            Err(err) => {
                last_error = Some(err.to_string());
                continue;
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            state.catalog.health().record_failure(provider_name, format!("status {status}"));
            last_error = Some(text);
            continue;
        }

        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap_or(serde_json::Value::Null);
        let tokens = extract_tokens(EndpointKind::AudioTranscriptions, &parsed, 0, 0);
        if let Some(api_key) = &billing_key {
            if let Err(err) = state.quota.record_usage(api_key, tokens, provider.token_multiplier).await {
                tracing::warn!(error = %err, "quota record_usage failed for transcription");
            }
        }
        state.catalog.health().record_success(provider_name);
        return Ok(axum::response::Json(parsed).into_response());
    }

    Err(AppError::AllProvidersFailed {
        details: last_error.unwrap_or_else(|| "no candidates attempted".to_string()),
        last_provider_error_body: None,
    })
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::super::router;
    use super::super::test_support::{build_state, spawn_mock_upstream};

    #[tokio::test]
    async fn rejects_unsupported_content_type_before_calling_upstream() {
        let providers = serde_json::json!({
            "endpoints": {
                "/v1/audio/transcriptions": {
                    "models": {
                        "whisper-1": [{
                            "name": "only",
                            "base_url": "http://127.0.0.1:1",
                            "max_concurrent_requests": 1,
                            "rate_limits": {"rpm": 1, "tpm": 1, "concurrent": 1}
                        }]
                    }
                }
            }
        })
        .to_string();
        let (state, _dir) = build_state(&providers, None);
        let app = router::build(state);

        let boundary = "X-TEST-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"clip.txt\"\r\nContent-Type: text/plain\r\n\r\nnot audio\r\n\
             --{boundary}--\r\n"
        );
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/audio/transcriptions")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(axum::body::Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepted_audio_forwards_and_returns_transcript() {
        let upstream = spawn_mock_upstream(200, serde_json::json!({"text": "hello world"})).await;
        let providers = serde_json::json!({
            "endpoints": {
                "/v1/audio/transcriptions": {
                    "models": {
                        "whisper-1": [{
                            "name": "only",
                            "base_url": upstream,
                            "max_concurrent_requests": 1,
                            "rate_limits": {"rpm": 60, "tpm": 100000, "concurrent": 5}
                        }]
                    }
                }
            }
        })
        .to_string();
        let (state, _dir) = build_state(&providers, None);
        let app = router::build(state);

        let boundary = "X-TEST-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"model\"\r\n\r\nwhisper-1\r\n\
             --{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\nRIFF....\r\n\
             --{boundary}--\r\n"
        );
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/audio/transcriptions")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(axum::body::Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["text"], "hello world");
    }
}
