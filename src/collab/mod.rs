//! Collaboration Modes: composing several logical models into one call.
//!
//! Fan-out/join implemented as spawn-and-join with per-task cancellation
//! on a structured-concurrency scope. `Race` is "wait for first success,
//! cancel the rest"; `MetaJudge` composes a fan-out with a single dependent
//! call.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;

const PER_CALL_TIMEOUT: Duration = Duration::from_secs(15);
const RACE_SAFETY_TIMEOUT: Duration = Duration::from_secs(16);
const JUDGE_MODEL: &str = "gpt-4";
const JUDGE_SYSTEM_PROMPT: &str = "You are a fair and critical evaluator.";

#[derive(Debug, Clone)]
pub struct CollabRequest {
    pub model: String,
    pub body: Value,
}

/// One fully-formed upstream call. Implemented by whatever wires the proxy
/// engine's `UpstreamClient` into this orchestration layer; kept abstract
/// here so collaboration logic has no HTTP dependency of its own.
pub trait Caller: Send + Sync {
    fn call(&self, req: CollabRequest) -> BoxFuture<'static, Result<Value, String>>;
}

#[derive(Debug, Clone)]
pub struct CallResult {
    pub success: bool,
    pub model: String,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CollabOutcome {
    pub merged: bool,
    pub results: Vec<CallResult>,
    pub merged_text: Option<String>,
    pub judge_output: Option<String>,
}

fn message_content(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

async fn call_with_timeout(caller: &Arc<dyn Caller>, req: CollabRequest) -> CallResult {
    let model = req.model.clone();
    match tokio::time::timeout(PER_CALL_TIMEOUT, caller.call(req)).await {
        Ok(Ok(output)) => CallResult {
            success: true,
            model,
            output: Some(output),
            error: None,
        },
        Ok(Err(err)) => CallResult {
            success: false,
            model,
            output: None,
            error: Some(err),
        },
        Err(_) => CallResult {
            success: false,
            model,
            output: None,
            error: Some("per-call timeout exceeded".to_string()),
        },
    }
}

/// Council: fan out all in parallel, return every result separately.
pub async fn council(caller: Arc<dyn Caller>, requests: Vec<CollabRequest>) -> CollabOutcome {
    let handles: Vec<_> = requests
        .into_iter()
        .map(|req| {
            let caller = Arc::clone(&caller);
            tokio::spawn(async move { call_with_timeout(&caller, req).await })
        })
        .collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        if let Ok(result) = handle.await {
            results.push(result);
        }
    }
    CollabOutcome {
        merged: false,
        results,
        merged_text: None,
        judge_output: None,
    }
}

/// Collaborate: fan out in parallel, concatenate successful message content
/// with `\n---\n`.
pub async fn collaborate(caller: Arc<dyn Caller>, requests: Vec<CollabRequest>) -> CollabOutcome {
    let outcome = council(caller, requests).await;
    let merged_text = outcome
        .results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.output.as_ref().and_then(message_content))
        .collect::<Vec<_>>()
        .join("\n---\n");
    CollabOutcome {
        merged: true,
        merged_text: Some(merged_text),
        ..outcome
    }
}

/// Race: resolve with the first success; 16 s safety timeout resolves
/// empty. Remaining in-flight calls are aborted.
pub async fn race(caller: Arc<dyn Caller>, requests: Vec<CollabRequest>) -> CollabOutcome {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<CallResult>(requests.len().max(1));
    let mut handles = Vec::with_capacity(requests.len());
    for req in requests {
        let caller = Arc::clone(&caller);
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let result = call_with_timeout(&caller, req).await;
            let _ = tx.send(result).await;
        }));
    }
    drop(tx);

    let winner = tokio::time::timeout(RACE_SAFETY_TIMEOUT, async {
        while let Some(result) = rx.recv().await {
            if result.success {
                return Some(result);
            }
        }
        None
    })
    .await
    .ok()
    .flatten();

    for handle in &handles {
        handle.abort();
    }

    CollabOutcome {
        merged: false,
        results: winner.into_iter().collect(),
        merged_text: None,
        judge_output: None,
    }
}

/// MetaJudge: fan out; on >=1 success, send the concatenated candidates to
/// a judge model with a fixed system prompt.
pub async fn meta_judge(caller: Arc<dyn Caller>, requests: Vec<CollabRequest>) -> CollabOutcome {
    let outcome = council(Arc::clone(&caller), requests).await;
    let candidates: Vec<String> = outcome
        .results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| r.output.as_ref().and_then(message_content))
        .collect();
    if candidates.is_empty() {
        return outcome;
    }

    let joined = candidates.join("\n---\n");
    let judge_body = serde_json::json!({
        "model": JUDGE_MODEL,
        "messages": [
            {"role": "system", "content": JUDGE_SYSTEM_PROMPT},
            {"role": "user", "content": joined},
        ],
    });
    let judge_req = CollabRequest {
        model: JUDGE_MODEL.to_string(),
        body: judge_body,
    };
    let judge_result = call_with_timeout(&caller, judge_req).await;
    let judge_output = judge_result.output.as_ref().and_then(message_content);

    CollabOutcome {
        merged: true,
        judge_output,
        ..outcome
    }
}

/// Discuss: sequential; each request sees the previous winner's content
/// appended as a user message. Final output = last successful content.
pub async fn discuss(caller: Arc<dyn Caller>, requests: Vec<CollabRequest>) -> CollabOutcome {
    let mut results = Vec::with_capacity(requests.len());
    let mut previous: Option<String> = None;

    for mut req in requests {
        if let Some(prev) = &previous {
            if let Some(messages) = req.body.get_mut("messages").and_then(|m| m.as_array_mut()) {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": format!("Refine the following:\n{prev}"),
                }));
            }
        }
        let result = call_with_timeout(&caller, req).await;
        if result.success {
            previous = result.output.as_ref().and_then(message_content);
        }
        results.push(result);
    }

    CollabOutcome {
        merged: true,
        merged_text: previous,
        results,
        judge_output: None,
    }
}

/// Fallback: sequential, first success returns; all-fail returns empty.
pub async fn fallback_sequential(caller: Arc<dyn Caller>, requests: Vec<CollabRequest>) -> CollabOutcome {
    let mut results = Vec::new();
    for req in requests {
        let result = call_with_timeout(&caller, req).await;
        let success = result.success;
        results.push(result);
        if success {
            break;
        }
    }
    CollabOutcome {
        merged: false,
        results,
        merged_text: None,
        judge_output: None,
    }
}
