//! Upstream HTTP client: building and sending one forwarded request.
//!
//! `build_upstream_url`/`post_json`/`post_sse`/`get_json`, plus a
//! `post_multipart` addition for audio-transcription forwarding.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Client, Response};
use serde_json::Value;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);
const USER_AGENT: &str = concat!("modelgate/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client builds");
        Self { client }
    }

    /// Trim trailing slash; strip a leading `/v1/` from the request path
    /// when the base URL is a legacy `/api/openai` host.
    pub fn build_upstream_url(base_url: &str, request_path: &str) -> String {
        let trimmed = base_url.trim_end_matches('/');
        let is_legacy = trimmed.contains("/api/openai");
        let path = if is_legacy {
            request_path.strip_prefix("/v1/").unwrap_or(request_path)
        } else {
            request_path.trim_start_matches('/')
        };
        format!("{trimmed}/{path}")
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder, api_key: Option<&str>, legacy: bool) -> reqwest::RequestBuilder {
        if legacy {
            return builder;
        }
        match api_key {
            Some(key) if !key.is_empty() => builder.bearer_auth(key),
            _ => builder,
        }
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        api_key: Option<&str>,
        legacy: bool,
    ) -> reqwest::Result<Response> {
        let mut builder = self
            .client
            .post(url)
            .timeout(UPSTREAM_TIMEOUT)
            .header("Content-Type", "application/json")
            .header("Accept", "*/*")
            .json(body);
        builder = self.apply_auth(builder, api_key, legacy);
        builder.send().await
    }

    /// No total timeout: relies on idle timeouts during relay, matching the
    /// teacher's `post_sse` (a long-lived SSE stream legitimately runs past
    /// `UPSTREAM_TIMEOUT`).
    pub async fn post_sse(
        &self,
        url: &str,
        body: &Value,
        api_key: Option<&str>,
        legacy: bool,
    ) -> reqwest::Result<Response> {
        let mut builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(body);
        builder = self.apply_auth(builder, api_key, legacy);
        builder.send().await
    }

    pub async fn get_json(&self, url: &str, api_key: Option<&str>, legacy: bool) -> reqwest::Result<Response> {
        let mut builder = self.client.get(url).timeout(UPSTREAM_TIMEOUT).header("Accept", "*/*");
        builder = self.apply_auth(builder, api_key, legacy);
        builder.send().await
    }

    pub async fn post_multipart(
        &self,
        url: &str,
        form: reqwest::multipart::Form,
        api_key: Option<&str>,
        legacy: bool,
    ) -> reqwest::Result<Response> {
        let mut builder = self.client.post(url).timeout(UPSTREAM_TIMEOUT).multipart(form);
        builder = self.apply_auth(builder, api_key, legacy);
        builder.send().await
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Upstream error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    ProviderDenial,
    RateLimitExceeded,
    TokenLimitExceeded,
    NetworkError,
    Upstream5xx,
}

pub fn classify_status(status: u16, body: &str) -> Option<UpstreamFailure> {
    match status {
        403 => Some(UpstreamFailure::ProviderDenial),
        429 => Some(UpstreamFailure::RateLimitExceeded),
        402 if body.to_ascii_lowercase().contains("token") => Some(UpstreamFailure::TokenLimitExceeded),
        500..=599 => Some(UpstreamFailure::Upstream5xx),
        _ => None,
    }
}

pub fn rewrite_model(mut body: Value, upstream_model_id: &str) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(upstream_model_id.to_string()));
    }
    body
}

pub fn strip_hop_by_hop(headers: &mut reqwest::header::HeaderMap) {
    for name in ["transfer-encoding", "connection", "content-encoding", "content-length"] {
        headers.remove(name);
    }
}

pub type RawChunk = Bytes;
