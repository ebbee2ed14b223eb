//! Kiosk console routes.
//!
//! A kiosk is a shared display next to the printer: it registers once with a
//! provisioned device token (checked against the device's pinned IP when one
//! is configured), receives an anonymous kiosk cookie, and can then view,
//! release, and cancel any held job.  It never claims: claiming binds a
//! personal identity the kiosk does not have.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{AppendHeaders, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::access::{Actor, Operation};
use crate::api::{require_kiosk, AppState};
use crate::error::ServerError;
use crate::session::{set_cookie, KIOSK_COOKIE};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/kiosk/register", post(register))
        .route("/kiosk/jobs", get(list_jobs))
        .route("/kiosk/jobs/:id/release", post(release_job))
        .route("/kiosk/jobs/:id/cancel", post(cancel_job))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    token: String,
}

async fn register(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> Result<Response, ServerError> {
    let client_ip = addr.ip().to_string();
    let device = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.validate_kiosk_token(&req.token, Some(&client_ip))?
    };

    let device = device.ok_or(ServerError::Unauthenticated)?;
    let cookie = state.sessions.create_kiosk().await;
    tracing::info!(device = %device.name, ip = %client_ip, "kiosk registered");

    Ok((
        AppendHeaders([(SET_COOKIE, set_cookie(KIOSK_COOKIE, cookie))]),
        Json(serde_json::json!({ "registered": device.name })),
    )
        .into_response())
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    require_kiosk(&state, &headers).await?;
    let jobs = state.reconciler.snapshot().await;
    Ok(Json(serde_json::json!({ "jobs": jobs })).into_response())
}

async fn release_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    require_kiosk(&state, &headers).await?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Kiosk, Operation::Release, &job)?;

    state.spooler.release(id).await?;
    tracing::info!(job_id = id, "job released at kiosk");
    Ok(Json(serde_json::json!({ "released": id })).into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    require_kiosk(&state, &headers).await?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Kiosk, Operation::Cancel, &job)?;

    state.spooler.cancel(id).await?;
    tracing::info!(job_id = id, "job canceled at kiosk");
    Ok(Json(serde_json::json!({ "canceled": id })).into_response())
}
