//! `/admin/keys`: list and mutate user records.
//!
//! Gated on `Authorization: Bearer <ADMIN_API_KEY>` rather than the normal
//! quota-backed auth gate; a mismatch is a flat 403.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::extract_api_key;
use crate::quota::User;

use super::state::AppState;

fn is_admin(state: &AppState, headers: &HeaderMap) -> bool {
    if state.admin_api_key.is_empty() {
        return false;
    }
    extract_api_key(headers).as_deref() == Some(state.admin_api_key.as_str())
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"error": {"message": "admin access required", "type": "forbidden_error"}})),
    )
        .into_response()
}

pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !is_admin(&state, &headers) {
        return forbidden();
    }
    let users: Vec<_> = state
        .quota
        .all()
        .into_iter()
        .map(|u| {
            json!({
                "api_key": u.api_key,
                "username": u.username,
                "plan": u.plan,
                "enabled": u.enabled,
                "total_tokens": u.total_tokens,
                "daily_tokens_used": u.daily_tokens_used,
            })
        })
        .collect();
    Json(json!({ "keys": users })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum AdminAction {
    Add {
        api_key: String,
        username: String,
        #[serde(default = "default_plan")]
        plan: String,
    },
    Enable {
        api_key: String,
    },
    Disable {
        api_key: String,
    },
    ChangePlan {
        api_key: String,
        plan: String,
    },
    Resetkey {
        api_key: String,
    },
}

fn default_plan() -> String {
    "0".to_string()
}

pub async fn act(State(state): State<AppState>, headers: HeaderMap, Json(action): Json<AdminAction>) -> Response {
    if !is_admin(&state, &headers) {
        return forbidden();
    }
    match action {
        AdminAction::Add { api_key, username, plan } => {
            let user = User {
                api_key,
                username,
                plan,
                enabled: true,
                total_tokens: 0,
                daily_tokens_used: 0,
                last_usage_timestamp: 0,
                last_updated_timestamp: 0,
                last_rotation_timestamp: None,
                expires_at: None,
                scopes: None,
            };
            match state.quota.insert(user) {
                Ok(()) => Json(json!({"ok": true})).into_response(),
                Err(err) => internal_error(err),
            }
        }
        AdminAction::Enable { api_key } => toggle(&state, &api_key, true),
        AdminAction::Disable { api_key } => toggle(&state, &api_key, false),
        AdminAction::ChangePlan { api_key, plan } => match state.quota.update(&api_key, |u| u.plan = plan) {
            Ok(true) => Json(json!({"ok": true})).into_response(),
            Ok(false) => not_found(),
            Err(err) => internal_error(err),
        },
        AdminAction::Resetkey { api_key } => {
            let new_key = format!("sk-{}", uuid::Uuid::new_v4());
            match state.quota.rename(&api_key, &new_key) {
                Ok(true) => Json(json!({"ok": true, "new_api_key": new_key})).into_response(),
                Ok(false) => not_found(),
                Err(err) => internal_error(err),
            }
        }
    }
}

fn toggle(state: &AppState, api_key: &str, enabled: bool) -> Response {
    match state.quota.update(api_key, |u| u.enabled = enabled) {
        Ok(true) => Json(json!({"ok": true})).into_response(),
        Ok(false) => not_found(),
        Err(err) => internal_error(err),
    }
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"message": "unknown api_key", "type": "invalid_request_error"}})),
    )
        .into_response()
}

fn internal_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %err, "admin action failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"message": "internal error", "type": "server_error"}})),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use tower::ServiceExt;

    use super::super::router;
    use super::super::test_support::build_state;

    fn empty_catalog() -> String {
        serde_json::json!({"endpoints": {}}).to_string()
    }

    async fn admin_request(
        app: axum::Router,
        method: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (axum::http::StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder().method(method).uri("/admin/keys");
        if let Some(key) = bearer {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        let request = if let Some(body) = body {
            builder
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.to_string()))
                .unwrap()
        } else {
            builder.body(axum::body::Body::empty()).unwrap()
        };
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, parsed)
    }

    #[tokio::test]
    async fn mismatched_admin_key_is_forbidden() {
        let (state, _dir) = build_state(&empty_catalog(), None);
        let app = router::build(state);
        let (status, _) = admin_request(app, "GET", Some("wrong-key"), None).await;
        assert_eq!(status, axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn add_then_disable_then_enable_round_trips() {
        let (state, _dir) = build_state(&empty_catalog(), None);
        let app = router::build(state);

        let add = serde_json::json!({"action": "add", "api_key": "sk-new", "username": "carol", "plan": "unlimited"});
        let (status, _) = admin_request(app.clone(), "POST", Some("sk-admin-test"), Some(add)).await;
        assert_eq!(status, axum::http::StatusCode::OK);

        let disable = serde_json::json!({"action": "disable", "api_key": "sk-new"});
        let (status, body) = admin_request(app.clone(), "POST", Some("sk-admin-test"), Some(disable)).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["ok"], true);

        let enable = serde_json::json!({"action": "enable", "api_key": "sk-new"});
        let (status, _) = admin_request(app.clone(), "POST", Some("sk-admin-test"), Some(enable)).await;
        assert_eq!(status, axum::http::StatusCode::OK);

        let (_, list_body) = admin_request(app, "GET", Some("sk-admin-test"), None).await;
        let keys = list_body["keys"].as_array().unwrap();
        let carol = keys.iter().find(|k| k["api_key"] == "sk-new").unwrap();
        assert_eq!(carol["enabled"], true);
    }

    #[tokio::test]
    async fn resetkey_moves_usage_to_a_new_key_with_no_grace_period() {
        let (state, _dir) = build_state(&empty_catalog(), None);
        let app = router::build(state);

        let add = serde_json::json!({"action": "add", "api_key": "sk-old", "username": "dave", "plan": "unlimited"});
        admin_request(app.clone(), "POST", Some("sk-admin-test"), Some(add)).await;

        let reset = serde_json::json!({"action": "resetkey", "api_key": "sk-old"});
        let (status, body) = admin_request(app.clone(), "POST", Some("sk-admin-test"), Some(reset)).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        let new_key = body["new_api_key"].as_str().unwrap().to_string();
        assert!(new_key.starts_with("sk-"));
        assert_ne!(new_key, "sk-old");

        let unknown_reset = serde_json::json!({"action": "resetkey", "api_key": "sk-old"});
        let (status, _) = admin_request(app, "POST", Some("sk-admin-test"), Some(unknown_reset)).await;
        assert_eq!(status, axum::http::StatusCode::NOT_FOUND);
    }
}
