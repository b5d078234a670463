//! HTTP API endpoints

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, Router},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::limiter::LoginLimiter;
use crate::metrics::ApiMetrics;
use crate::models::{LoginLog, SysInfo, User};
use crate::presence::PresenceCache;
use crate::store::PeerStore;

#[derive(Clone)]
pub struct ApiState {
    pub presence: Arc<PresenceCache>,
    pub peers: Arc<dyn PeerStore>,
    pub limiter: Arc<LoginLimiter>,
    pub authenticator: Arc<dyn Authenticator>,
    pub metrics: Arc<ApiMetrics>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<ServerConfig>,
}

/// Create API router
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/sysinfo", post(sysinfo))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Address the request came from. Behind a reverse proxy the left-most
/// `X-Forwarded-For` entry is used when the deployment says it can be trusted.
fn client_ip(headers: &HeaderMap, addr: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split(',').next())
            .and_then(|s| s.trim().parse().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    addr.ip()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    #[serde(default)]
    uuid: String,
}

/// POST /api/heartbeat - Record that a peer is online.
///
/// Always answers `200 {}`; heartbeats are telemetry and clients ignore the body.
async fn heartbeat(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Response {
    let accepted = match payload {
        Ok(Json(request)) => {
            let ip = client_ip(&headers, addr, state.config.trust_forwarded_for);
            state
                .presence
                .touch(&request.uuid, &ip.to_string(), state.clock.now())
                .await
        }
        Err(e) => {
            debug!("Malformed heartbeat from {}: {}", addr.ip(), e);
            false
        }
    };

    if accepted {
        state.metrics.heartbeats.inc();
    } else {
        state.metrics.heartbeats_dropped.inc();
    }
    state.metrics.cached_peers.set(state.presence.len() as f64);

    (StatusCode::OK, Json(json!({}))).into_response()
}

/// POST /api/sysinfo - Register a peer or refresh its system information
async fn sysinfo(
    State(state): State<ApiState>,
    payload: Result<Json<SysInfo>, JsonRejection>,
) -> Response {
    let info = match payload {
        Ok(Json(info)) if !info.uuid.is_empty() => info,
        _ => return (StatusCode::BAD_REQUEST, "ParamsError").into_response(),
    };

    match state.peers.register_peer(&info).await {
        Ok(peer) => {
            info!("Peer {} registered (row {}, id {})", peer.uuid, peer.row_id, peer.device_id);
            (StatusCode::OK, "SYSINFO_UPDATED").into_response()
        }
        Err(e) => {
            error!("Failed to register peer {}: {}", info.uuid, e);
            (StatusCode::INTERNAL_SERVER_ERROR, "SystemError").into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeviceInfo {
    #[serde(default)]
    os: String,
    #[serde(default, rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    uuid: String,
    #[serde(default, rename = "deviceInfo")]
    device_info: DeviceInfo,
}

#[derive(Debug, Serialize)]
struct UserPayload {
    name: String,
    email: String,
    status: i64,
    is_admin: bool,
}

impl From<&User> for UserPayload {
    fn from(user: &User) -> Self {
        Self {
            name: user.username.clone(),
            email: user.email.clone(),
            status: user.status.as_i64(),
            is_admin: user.is_admin,
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    access_token: String,
    #[serde(rename = "type")]
    kind: &'static str,
    user: UserPayload,
}

/// Reply to an attempt that was already counted by the limiter
fn login_failed(state: &ApiState, ip: IpAddr, attempt: u32, reason: &str) -> Response {
    state.metrics.login_failures.inc();
    state.metrics.limiter_windows.set(state.limiter.len() as f64);
    warn!("Login Fail: {} {} (attempt {})", reason, ip, attempt);
    error_response(StatusCode::BAD_REQUEST, reason)
}

/// POST /api/login - Password login, gated by the failed-login limiter
async fn login(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    if state.config.disable_pwd_login {
        return error_response(StatusCode::BAD_REQUEST, "PwdLoginDisabled");
    }

    let ip = client_ip(&headers, addr, state.config.trust_forwarded_for);
    let now = state.clock.now();

    let attempt = match state.limiter.try_begin(ip, now) {
        Ok(attempt) => attempt,
        Err(retry_after) => {
            state.metrics.login_lockouts.inc();
            warn!("Login rejected for {}: locked out for another {}s", ip, retry_after);
            let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "LoginLocked");
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            return response;
        }
    };

    let request = match payload {
        Ok(Json(request)) => request,
        Err(e) => {
            debug!("Malformed login body from {}: {}", ip, e);
            return login_failed(&state, ip, attempt, "ParamsError");
        }
    };
    if request.username.is_empty() || request.password.is_empty() {
        return login_failed(&state, ip, attempt, "ParamsError");
    }

    let user = match state.authenticator.authenticate(&request.username, &request.password).await {
        Ok(Some(user)) => user,
        Ok(None) => return login_failed(&state, ip, attempt, "UsernameOrPasswordError"),
        Err(e) => {
            state.limiter.release(ip);
            error!("Credential check failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "SystemError");
        }
    };

    // The password was right, so this client is not guessing.
    state.limiter.reset(ip);
    state.metrics.limiter_windows.set(state.limiter.len() as f64);

    if !user.is_enabled() {
        return error_response(StatusCode::BAD_REQUEST, "UserDisabled");
    }

    // Browsers send a referer, native clients do not.
    let client = if headers.contains_key(header::REFERER) {
        "webclient".to_string()
    } else {
        request.device_info.kind
    };
    let log = LoginLog {
        user_id: user.id,
        client,
        device_id: request.id,
        uuid: request.uuid,
        ip: ip.to_string(),
        login_type: "account".to_string(),
        platform: request.device_info.os,
    };

    let expires_at = now.saturating_add(state.config.token_ttl_secs);
    match state.authenticator.issue_token(&user, &log, expires_at).await {
        Ok(access_token) => {
            info!("User {} logged in from {}", user.username, ip);
            let body = LoginResponse {
                access_token,
                kind: "access_token",
                user: UserPayload::from(&user),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!("Failed to issue token for {}: {}", user.username, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "SystemError")
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// POST /api/logout - Drop the session behind the bearer token
async fn logout(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(StatusCode::UNAUTHORIZED, "NotLogin");
    };

    match state.authenticator.revoke_token(token, state.clock.now()).await {
        Ok(true) => (StatusCode::OK, Json(serde_json::Value::Null)).into_response(),
        Ok(false) => error_response(StatusCode::UNAUTHORIZED, "NotLogin"),
        Err(e) => {
            error!("Failed to revoke session: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "SystemError")
        }
    }
}

/// GET /health
async fn health_handler(State(state): State<ApiState>) -> Response {
    let body = json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "cached_peers": state.presence.len(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /metrics
async fn metrics_handler(State(state): State<ApiState>) -> Response {
    state.metrics.limiter_windows.set(state.limiter.len() as f64);
    match state.metrics.export_prometheus() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
