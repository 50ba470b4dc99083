//! A minimal bearer-JWT guard for the admin surface: one symmetric secret,
//! one claim set, no rotation or fingerprinting. Adapted (drastically cut
//! down) from the teacher's `enterprise/auth/jwt.rs` `JwtManager`, which
//! supports RSA/ECDSA, refresh-token rotation, and device fingerprinting —
//! machinery this crate's single-operator admin panel has no use for.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::app::AppState;

const TOKEN_TTL_SECONDS: u64 = 8 * 3600;
const LOGIN_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;
const LOGIN_RATE_LIMIT_MAX_ATTEMPTS: i64 = 10;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: u64,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in: u64,
}

fn issue_token(secret: &str, username: &str) -> String {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs() + TOKEN_TTL_SECONDS;
    let claims = Claims { sub: username.to_string(), exp };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).expect("HS256 encoding never fails")
}

fn verify_token(secret: &str, token: &str) -> bool {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &Validation::default()).is_ok()
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let rate_key = format!("rate_limit:login:{}", addr.ip());
    let mut conn = state.redis.clone();
    let attempts: i64 = conn.incr(&rate_key, 1).await.unwrap_or(0);
    if attempts == 1 {
        let _: Result<(), _> = conn.expire(&rate_key, LOGIN_RATE_LIMIT_WINDOW_SECONDS as i64).await;
    }
    if attempts > LOGIN_RATE_LIMIT_MAX_ATTEMPTS {
        return (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({ "error": "rate_limited" }))).into_response();
    }

    if req.username != state.config.admin_username || req.password != state.config.admin_password {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid_credentials" }))).into_response();
    }

    let token = issue_token(&state.config.jwt_secret, &req.username);
    Json(LoginResponse { token, expires_in: TOKEN_TTL_SECONDS }).into_response()
}

/// Gates every other `/admin/*` route behind `Authorization: Bearer <jwt>`,
/// and behind `Config::panel_admin_enabled()` being true at all.
pub async fn require_admin(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    if !state.config.panel_admin_enabled() {
        return (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": "not_found" }))).into_response();
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "missing_token" }))).into_response();
    };

    if !verify_token(&state.config.jwt_secret, &token) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid_token" }))).into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_verifies_with_same_secret() {
        let token = issue_token("shh", "admin");
        assert!(verify_token("shh", &token));
    }

    #[test]
    fn token_rejected_with_wrong_secret() {
        let token = issue_token("shh", "admin");
        assert!(!verify_token("different", &token));
    }
}
