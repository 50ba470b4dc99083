//! The upstream's callback surface: one POST endpoint receiving execution
//! results, HMAC-verified, heartbeat-filtered, and deposited into the
//! Redis rendezvous key the dispatcher polls — plus a readiness GET for
//! upstream health probes.
//!
//! HMAC verification is hand-rolled directly with `hmac`/`sha2`
//! (`Hmac<Sha256>`, `Mac::verify_slice` for constant time) since no crate
//! in the example pack offers webhook signature verification as a
//! library; both dependencies are already part of the teacher's stack.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use redis::AsyncCommands;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;

use crate::app::AppState;

const HEARTBEAT_STATUSES: &[&str] = &["running", "sync", "pending", "queued"];
const RENDEZVOUS_TTL_SECONDS: u64 = 30 * 60;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/webhook/mengla-notify", post(receive))
        .route("/api/webhook/mengla-notify", get(readiness))
}

async fn readiness() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "mengla-collector-webhook" }))
}

async fn receive(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        if let Err(resp) = verify_signature(secret, &headers, &body) {
            return resp;
        }
    } else {
        tracing::warn!("WEBHOOK_SECRET unset, skipping signature verification");
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(%err, "webhook body was not valid JSON");
            return (StatusCode::BAD_REQUEST, Json(json!({ "status": "error", "reason": "invalid json" }))).into_response();
        }
    };

    let Some(execution_id) = extract_execution_id(&payload) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "status": "error", "reason": "missing executionId" }))).into_response();
    };

    let status = payload.get("status").and_then(Value::as_str).map(str::to_lowercase);
    if let Some(status) = status {
        if HEARTBEAT_STATUSES.contains(&status.as_str()) {
            tracing::debug!(execution_id, status, "webhook heartbeat acknowledged, not stored");
            return Json(json!({ "status": "ok", "skipped": true, "reason": "heartbeat" })).into_response();
        }
    }

    let result = payload
        .get("resultData")
        .or_else(|| payload.get("data"))
        .cloned()
        .unwrap_or_else(|| payload.clone());

    let key = format!("mengla:exec:{execution_id}");
    let serialized = result.to_string();
    let mut conn = state.redis.clone();
    if let Err(err) = conn.set_ex::<_, _, ()>(&key, serialized, RENDEZVOUS_TTL_SECONDS).await {
        tracing::error!(%err, execution_id, "failed to store webhook result for rendezvous");
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "status": "error", "reason": "storage failure" }))).into_response();
    }

    tracing::info!(execution_id, "webhook result stored for rendezvous");
    Json(json!({ "status": "ok" })).into_response()
}

fn extract_execution_id(payload: &Value) -> Option<String> {
    payload
        .get("executionId")
        .or_else(|| payload.get("execution_id"))
        .or_else(|| payload.get("data").and_then(|d| d.get("executionId")))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn verify_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), axum::response::Response> {
    let reject = || (StatusCode::UNAUTHORIZED, Json(json!({ "status": "error", "reason": "bad signature" }))).into_response();

    let header = headers.get("X-Signature-256").and_then(|v| v.to_str().ok()).ok_or_else(reject)?;
    let hex_sig = header.strip_prefix("sha256=").ok_or_else(reject)?;
    let expected = hex::decode(hex_sig).map_err(|_| reject())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    mac.verify_slice(&expected).map_err(|_| reject())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_execution_id_at_top_level() {
        let payload = json!({ "executionId": "abc-1" });
        assert_eq!(extract_execution_id(&payload).as_deref(), Some("abc-1"));
    }

    #[test]
    fn finds_execution_id_nested_under_data() {
        let payload = json!({ "data": { "executionId": "abc-2" } });
        assert_eq!(extract_execution_id(&payload).as_deref(), Some("abc-2"));
    }

    #[test]
    fn finds_execution_id_snake_case() {
        let payload = json!({ "execution_id": "abc-3" });
        assert_eq!(extract_execution_id(&payload).as_deref(), Some("abc-3"));
    }

    #[test]
    fn missing_execution_id_is_none() {
        let payload = json!({ "status": "running" });
        assert!(extract_execution_id(&payload).is_none());
    }

    #[test]
    fn signature_round_trips() {
        let secret = "shh";
        let body = br#"{"executionId":"abc"}"#;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        let sig = hex::encode(mac.finalize().into_bytes());

        let mut headers = HeaderMap::new();
        headers.insert("X-Signature-256", format!("sha256={sig}").parse().unwrap());
        assert!(verify_signature(secret, &headers, body).is_ok());
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Signature-256", "sha256=deadbeef".parse().unwrap());
        assert!(verify_signature("shh", &headers, b"{}").is_err());
    }

    #[test]
    fn missing_signature_header_is_rejected() {
        let headers = HeaderMap::new();
        assert!(verify_signature("shh", &headers, b"{}").is_err());
    }
}
