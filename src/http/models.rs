//! `GET /v1/models`.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::state::AppState;

pub async fn handler(State(state): State<AppState>) -> Json<Value> {
    let created = (state.started_at_unix_ms / 1000) as i64;
    let data: Vec<Value> = state
        .catalog
        .models()
        .into_iter()
        .map(|m| {
            json!({
                "id": m.logical_id,
                "object": "model",
                "created": created,
                "owned_by": m.owner,
                "token_multiplier": m.token_multiplier,
                "endpoint": m.endpoint_path,
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}
