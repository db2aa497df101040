use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use crate::server::{AppState, CALLER_HEADER};
use crate::operator::{Command, Operator, Reply, CONSOLE};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Deserialize)]
pub struct CheckParams {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub message: Option<String>,
}

#[derive(Deserialize)]
pub struct RemoteRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str) -> ApiError {
    (status, Json(ErrorResponse { error: error.to_string() }))
}

/// Gate decision for the broker's preconnect hook
pub async fn check(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckParams>,
) -> Json<CheckResponse> {
    let decision = state.gate.check(&params.name).await;
    Json(match decision {
        crate::Decision::Permit => CheckResponse { allowed: true, message: None },
        crate::Decision::Deny(message) => CheckResponse { allowed: false, message: Some(message) },
    })
}

pub async fn remote_add(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RemoteRequest>,
) -> Result<Json<Reply>, ApiError> {
    let (caller, operator) = authorize(&state, &headers)?;
    finish(operator.add(&caller, &body.username).await)
}

pub async fn remote_remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RemoteRequest>,
) -> Result<Json<Reply>, ApiError> {
    let (caller, operator) = authorize(&state, &headers)?;
    finish(operator.remove(&caller, &body.username).await)
}

/// Only callers on `remote.allowed_callers` may mutate the list, and only
/// while the channel is enabled.
fn authorize<'a>(state: &'a AppState, headers: &HeaderMap) -> Result<(String, &'a Operator), ApiError> {
    let operator = state
        .remote
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "remote channel is unavailable"))?;

    let caller = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "missing caller id"))?;

    let allowed = state
        .settings
        .read(|s| s.remote.allowed_callers.iter().any(|c| c == caller));
    if !allowed {
        tracing::warn!("Rejected remote request from {}", caller);
        return Err(api_error(StatusCode::FORBIDDEN, "caller is not allowed"));
    }

    Ok((caller.to_string(), operator))
}

/// Operator commands from the local CLI, applied to this process's cache.
///
/// Refused commands still answer 200; the reply's `ok` carries the outcome.
pub async fn admin(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(command): Json<Command>,
) -> Result<Json<Reply>, ApiError> {
    if !peer.ip().is_loopback() {
        tracing::warn!("Rejected admin request from {}", peer);
        return Err(api_error(StatusCode::FORBIDDEN, "admin commands are local only"));
    }
    let operator = state
        .admin
        .as_ref()
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "whitelist is unavailable"))?;
    Ok(Json(operator.execute(CONSOLE, &command).await))
}

fn finish(reply: Reply) -> Result<Json<Reply>, ApiError> {
    if reply.ok {
        Ok(Json(reply))
    } else {
        Err(api_error(StatusCode::CONFLICT, &reply.text))
    }
}
