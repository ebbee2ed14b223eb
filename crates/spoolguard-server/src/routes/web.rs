//! Session-authenticated browser surface (JSON; rendering is the SPA's job).
//!
//! Login is delegated to the configured OIDC issuer.  All job operations act
//! as the session's platform identity against the reconciled effective
//! owner, so claimed and device-mapped jobs behave exactly like the user's
//! own submissions.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::SET_COOKIE;
use axum::http::HeaderMap;
use axum::response::{AppendHeaders, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use spoolguard_store::{ClaimOutcome, SubmitChannel};

use crate::access::{Actor, Operation};
use crate::api::{
    read_submission, require_admin_session, require_session, submit_document, AppState,
};
use crate::error::ServerError;
use crate::reconcile::Reconciler;
use crate::session::{clear_cookie, cookie_value, set_cookie, SESSION_COOKIE};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login))
        .route("/authorize", get(authorize))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/dashboard", get(dashboard))
        .route("/admin", get(admin_overview))
        .route("/jobs/:id/release", post(release_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/claim", post(claim_job))
        .route("/printer/status", get(printer_status))
        .route("/upload", post(upload))
}

fn identity(state: &AppState) -> Result<&dyn crate::identity::IdentityProvider, ServerError> {
    state
        .identity
        .as_deref()
        .ok_or_else(|| ServerError::Upstream("single sign-on is not configured".into()))
}

async fn login(State(state): State<AppState>) -> Result<Redirect, ServerError> {
    // The state nonce is round-tripped through the issuer; sessions are not
    // yet established so it is purely a CSRF token for the callback.
    let nonce = Uuid::new_v4().to_string();
    let url = identity(&state)?.authorize_url(&nonce).await?;
    Ok(Redirect::temporary(&url))
}

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    code: String,
}

async fn authorize(
    State(state): State<AppState>,
    Query(query): Query<AuthorizeQuery>,
) -> Result<Response, ServerError> {
    let user = identity(&state)?.exchange_code(&query.code).await?;
    tracing::info!(username = %user.username, "session established");

    let token = state.sessions.create(user).await;
    Ok((
        AppendHeaders([(SET_COOKIE, set_cookie(SESSION_COOKIE, token))]),
        Redirect::temporary("/dashboard"),
    )
        .into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = cookie_value(&headers, SESSION_COOKIE) {
        if let Some(user) = state.sessions.remove(token).await {
            tracing::info!(username = %user.username, "session ended");
        }
    }
    (
        AppendHeaders([(SET_COOKIE, clear_cookie(SESSION_COOKIE))]),
        Json(serde_json::json!({ "logged_out": true })),
    )
        .into_response()
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ServerError> {
    let user = require_session(&state, &headers).await?;
    let is_admin = state.gate.is_admin(&user);
    Ok(Json(serde_json::json!({ "user": user, "is_admin": is_admin })).into_response())
}

async fn dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let user = require_session(&state, &headers).await?;

    let snapshot = state.reconciler.snapshot().await;
    let partition = Reconciler::partition(snapshot, &user.username);
    Ok(Json(partition).into_response())
}

async fn admin_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    require_admin_session(&state, &headers).await?;

    let jobs = state.reconciler.snapshot().await;
    let (keys, device_mappings, email_mappings, kiosks) = {
        let db = state.db.lock().expect("store mutex poisoned");
        (
            db.list_api_keys()?,
            db.list_device_mappings()?,
            db.list_email_mappings()?,
            db.list_kiosk_devices()?,
        )
    };

    Ok(Json(serde_json::json!({
        "jobs": jobs,
        "keys": keys,
        "device_mappings": device_mappings,
        "email_mappings": email_mappings,
        "kiosks": kiosks,
    }))
    .into_response())
}

async fn release_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let user = require_session(&state, &headers).await?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Session(user.clone()), Operation::Release, &job)?;

    state.spooler.release(id).await?;
    tracing::info!(job_id = id, username = %user.username, "job released");
    Ok(Json(serde_json::json!({ "released": id })).into_response())
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let user = require_session(&state, &headers).await?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Session(user.clone()), Operation::Cancel, &job)?;

    state.spooler.cancel(id).await?;
    tracing::info!(job_id = id, username = %user.username, "job canceled");
    Ok(Json(serde_json::json!({ "canceled": id })).into_response())
}

async fn claim_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let user = require_session(&state, &headers).await?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Session(user.clone()), Operation::Claim, &job)?;

    let outcome = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.claim_job(id, &user.username)?
    };
    match outcome {
        ClaimOutcome::Claimed => {
            tracing::info!(job_id = id, username = %user.username, "job claimed");
            Ok(Json(serde_json::json!({ "claimed": id })).into_response())
        }
        ClaimOutcome::AlreadyClaimed { by } => Err(ServerError::AlreadyClaimed(by)),
    }
}

async fn printer_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    require_session(&state, &headers).await?;

    let printers = state.spooler.printers().await?;
    let status = printers
        .into_iter()
        .find(|p| p.name == state.config.printer_name)
        .ok_or_else(|| ServerError::NotFound(format!("printer {}", state.config.printer_name)))?;
    Ok(Json(status).into_response())
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ServerError> {
    let user = require_session(&state, &headers).await?;

    let submission = read_submission(multipart).await?;
    let job_id = submit_document(&state, submission, SubmitChannel::Web, &user.username).await?;

    Ok(Json(serde_json::json!({ "job_id": job_id, "held": true })).into_response())
}
