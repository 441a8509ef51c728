//! Proxy Engine: building and sending upstream requests.

pub mod sse;
pub mod tokens;
pub mod upstream;

pub use sse::{tap_passthrough, SseTap};
pub use tokens::{estimate_streaming_tokens, extract_tokens, EndpointKind};
pub use upstream::{classify_status, rewrite_model, strip_hop_by_hop, UpstreamClient, UpstreamFailure};

use serde_json::Value;

use crate::catalog::Provider;

/// Everything the forwarder needs to build one upstream call.
pub struct ForwardRequest<'a> {
    pub provider: &'a Provider,
    pub request_path: &'a str,
    pub body: Value,
    pub client_api_key: Option<&'a str>,
}

pub struct ForwardTarget {
    pub url: String,
    pub body: Value,
    pub api_key: Option<String>,
    pub legacy: bool,
}

/// Construct the URL, rewrite `model`, resolve the auth key to attach
/// (falling back to the client's own key when the provider has none
/// configured).
pub fn build_forward_target(req: ForwardRequest<'_>) -> ForwardTarget {
    let url = UpstreamClient::build_upstream_url(&req.provider.base_url, req.request_path);
    let legacy = req.provider.base_url.contains("/api/openai");
    let body = rewrite_model(req.body, &req.provider.upstream_model_id);
    let api_key = req
        .provider
        .api_key()
        .or_else(|| req.client_api_key.map(str::to_string));
    ForwardTarget {
        url,
        body,
        api_key,
        legacy,
    }
}

pub fn is_event_stream(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ApiKeyRef, ProviderMetadata, RateLimits};

    fn provider(base_url: &str) -> Provider {
        Provider {
            name: "p".to_string(),
            base_url: base_url.to_string(),
            api_key_ref: ApiKeyRef::Literal("sk-upstream".to_string()),
            upstream_model_id: "gpt-4-upstream".to_string(),
            priority: 1,
            token_multiplier: 1.0,
            metadata: ProviderMetadata::default(),
            rate_limits: RateLimits { rpm: 60, tpm: 1000, concurrent: 10 },
            max_concurrent_requests: 10,
            capabilities: vec![],
        }
    }

    #[test]
    fn build_forward_target_rewrites_model_and_resolves_key() {
        let p = provider("https://api.example.com/v1");
        let target = build_forward_target(ForwardRequest {
            provider: &p,
            request_path: "/v1/chat/completions",
            body: serde_json::json!({"model": "gpt-4", "messages": []}),
            client_api_key: None,
        });
        assert_eq!(target.body["model"], "gpt-4-upstream");
        assert_eq!(target.api_key, Some("sk-upstream".to_string()));
        assert!(!target.legacy);
    }

    #[test]
    fn falls_back_to_client_key_when_provider_has_none() {
        let mut p = provider("https://api.example.com/v1");
        p.api_key_ref = ApiKeyRef::None;
        let target = build_forward_target(ForwardRequest {
            provider: &p,
            request_path: "/v1/chat/completions",
            body: serde_json::json!({"model": "gpt-4"}),
            client_api_key: Some("sk-client"),
        });
        assert_eq!(target.api_key, Some("sk-client".to_string()));
    }

    #[test]
    fn is_event_stream_matches_content_type() {
        assert!(is_event_stream(Some("text/event-stream; charset=utf-8")));
        assert!(!is_event_stream(Some("application/json")));
        assert!(!is_event_stream(None));
    }
}
