//! Token-count extraction from upstream responses.

use serde_json::Value;

/// Which per-endpoint token-accounting rule applies. Token-extraction
/// strategy is one of the things the per-endpoint descriptor varies,
/// alongside error-classification rules and body-rewrite hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    ChatCompletions,
    ImageGenerations,
    AudioTranscriptions,
    AudioSpeech,
    Responses,
}

fn ceil_div(n: usize, d: usize) -> u64 {
    ((n + d - 1) / d) as u64
}

/// Buffered (non-streaming) response token extraction, priority order:
/// (a) `usage.total_tokens`; (b) `usage.prompt_tokens + usage.completion_tokens`;
/// (c) estimate from input/body length. Endpoint-specific overrides apply
/// for images, audio transcription, and audio speech.
pub fn extract_tokens(kind: EndpointKind, body: &Value, input_chars: usize, body_bytes: usize) -> u64 {
    match kind {
        EndpointKind::ImageGenerations => 1,
        EndpointKind::AudioTranscriptions => match body.get("text").and_then(|v| v.as_str()) {
            Some(text) if !text.is_empty() => ceil_div(text.len(), 4),
            _ => 1,
        },
        EndpointKind::AudioSpeech => {
            // Intentionally the literal character length of `input`, not
            // ceil(len/4) like every other endpoint. No `input` field at
            // all still bills as 1, same as the other "absent" cases.
            if input_chars == 0 {
                1
            } else {
                input_chars as u64
            }
        }
        EndpointKind::ChatCompletions | EndpointKind::Responses => {
            if let Some(total) = body.pointer("/usage/total_tokens").and_then(|v| v.as_u64()) {
                return total;
            }
            let prompt = body.pointer("/usage/prompt_tokens").and_then(|v| v.as_u64());
            let completion = body.pointer("/usage/completion_tokens").and_then(|v| v.as_u64());
            if let (Some(p), Some(c)) = (prompt, completion) {
                return p + c;
            }
            ceil_div(input_chars, 4) + ceil_div(body_bytes, 4)
        }
    }
}

/// Streaming token estimate: `ceil(accumulated_chars / 4)`.
pub fn estimate_streaming_tokens(accumulated_chars: usize) -> u64 {
    ceil_div(accumulated_chars, 4)
}
