//! HTTP surface wiring: application state, authentication helpers, the
//! shared submission pipeline, and the router.
//!
//! Three independent authentication schemes coexist:
//! - bearer credentials (`Authorization: Bearer` or `X-API-Key`) for the
//!   token API, rate-limited per credential per minute;
//! - opaque session cookies established through the OIDC login flow;
//! - kiosk cookies established by exchanging a registered device token.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{DefaultBodyLimit, Multipart};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use spoolguard_store::{ApiKey, Database, Permission, SubmitChannel};

use crate::access::{key_satisfies, AccessGate};
use crate::config::ServerConfig;
use crate::convert::{sanitize_filename, validate_upload, Converter};
use crate::error::ServerError;
use crate::identity::IdentityProvider;
use crate::reconcile::Reconciler;
use crate::routes;
use crate::session::{cookie_value, SessionStore, SessionUser, KIOSK_COOKIE, SESSION_COOKIE};
use crate::spooler::{PrintOptions, Spooler};

/// Sentinel "remaining" value for actors not subject to rate limiting.
pub const UNLIMITED: i64 = -1;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub spooler: Arc<dyn Spooler>,
    pub converter: Arc<dyn Converter>,
    pub reconciler: Arc<Reconciler>,
    pub sessions: SessionStore,
    pub gate: AccessGate,
    pub identity: Option<Arc<dyn IdentityProvider>>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .nest("/api/v1", routes::api_v1::router())
        .merge(routes::web::router())
        .merge(routes::kiosk::router())
        .layer(DefaultBodyLimit::max(state.config.max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "HTTP server listening");
    // ConnectInfo is needed for the advisory kiosk IP check.
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Authentication helpers
// ---------------------------------------------------------------------------

/// Pull the raw credential out of `Authorization: Bearer` or `X-API-Key`.
fn raw_credential(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Validate a bearer credential: existence and liveness, then the
/// fixed-window rate limit, then the permission tier.  Order matters: a
/// denied request still consumes rate-limit budget, and the limit check
/// happens before the tier check so abusive under-privileged keys are
/// throttled too.
pub fn require_api_key(
    state: &AppState,
    headers: &HeaderMap,
    required: Permission,
) -> Result<(ApiKey, i64), ServerError> {
    let raw = raw_credential(headers).ok_or(ServerError::Unauthenticated)?;

    let db = state.db.lock().expect("store mutex poisoned");
    let key = db
        .validate_api_key(&raw)?
        .ok_or(ServerError::Unauthenticated)?;

    let (allowed, remaining) = db.check_rate_limit(&raw, state.config.api_rate_limit)?;
    if !allowed {
        return Err(ServerError::RateLimited);
    }

    if !key_satisfies(&key, required) {
        return Err(ServerError::PermissionDenied(format!(
            "key '{}' lacks the {required} permission",
            key.name
        )));
    }

    Ok((key, remaining))
}

pub async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<SessionUser, ServerError> {
    let token = cookie_value(headers, SESSION_COOKIE).ok_or(ServerError::Unauthenticated)?;
    state.sessions.get(token).await.ok_or(ServerError::Unauthenticated)
}

pub async fn require_admin_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<SessionUser, ServerError> {
    let user = require_session(state, headers).await?;
    if state.gate.is_admin(&user) {
        Ok(user)
    } else {
        Err(ServerError::PermissionDenied("administrator access required".into()))
    }
}

/// Admin surface shared by the token API and the browser: an admin-tier
/// credential or an admin session both pass.  Returns the rate-limit
/// remainder for the credential path, [`UNLIMITED`] for sessions.
pub async fn key_or_admin_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<i64, ServerError> {
    if raw_credential(headers).is_some() {
        let (_, remaining) = require_api_key(state, headers, Permission::Admin)?;
        return Ok(remaining);
    }
    require_admin_session(state, headers).await?;
    Ok(UNLIMITED)
}

pub async fn require_kiosk(state: &AppState, headers: &HeaderMap) -> Result<(), ServerError> {
    let token = cookie_value(headers, KIOSK_COOKIE).ok_or(ServerError::Unauthenticated)?;
    if state.sessions.is_kiosk(token).await {
        Ok(())
    } else {
        Err(ServerError::Unauthenticated)
    }
}

/// JSON response carrying `X-RateLimit-Remaining` when the actor is
/// rate-limited; the header is omitted for the [`UNLIMITED`] sentinel.
pub fn rate_limited_json<T: Serialize>(remaining: i64, value: T) -> Response {
    let mut response = Json(value).into_response();
    if remaining >= 0 {
        if let Ok(header) = HeaderValue::from_str(&remaining.to_string()) {
            response.headers_mut().insert("x-ratelimit-remaining", header);
        }
    }
    response
}

// ---------------------------------------------------------------------------
// Shared submission pipeline
// ---------------------------------------------------------------------------

/// A parsed print submission: the document plus its options.
pub struct Submission {
    pub filename: String,
    pub content: Vec<u8>,
    pub options: PrintOptions,
    pub printer: Option<String>,
}

/// Read a multipart print form: a required `file` field plus optional
/// `copies`, `duplex`, `color`, `page_range`, and `printer` fields.
pub async fn read_submission(mut multipart: Multipart) -> Result<Submission, ServerError> {
    let mut filename = None;
    let mut content = None;
    let mut options = PrintOptions::default();
    let mut printer = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::Validation(format!("multipart error: {e}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                filename = Some(field.file_name().unwrap_or("upload").to_string());
                content = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ServerError::Validation(format!("failed to read file: {e}")))?
                        .to_vec(),
                );
            }
            "copies" => {
                let text = field.text().await.unwrap_or_default();
                options.copies = text.trim().parse().ok().filter(|n| (1..=99).contains(n));
            }
            "duplex" => {
                let text = field.text().await.unwrap_or_default();
                options.duplex = text == "true" || text == "on" || text == "1";
            }
            "color" => {
                // The form speaks "color"; the spooler option is grayscale.
                let text = field.text().await.unwrap_or_default();
                options.grayscale = !(text == "true" || text == "on" || text == "1");
            }
            "page_range" => {
                let text = field.text().await.unwrap_or_default();
                let text = text.trim().to_string();
                if !text.is_empty() {
                    if !text.chars().all(|c| c.is_ascii_digit() || c == ',' || c == '-') {
                        return Err(ServerError::Validation("invalid page range".into()));
                    }
                    options.page_ranges = Some(text);
                }
            }
            "printer" => {
                let text = field.text().await.unwrap_or_default();
                let text = text.trim().to_string();
                if !text.is_empty() {
                    printer = Some(text);
                }
            }
            _ => {}
        }
    }

    let filename = filename.ok_or_else(|| ServerError::Validation("missing 'file' field".into()))?;
    let content = content.ok_or_else(|| ServerError::Validation("missing 'file' field".into()))?;

    Ok(Submission { filename, content, options, printer })
}

/// Validate, stage, convert, submit held, and record the ledger row.
/// Returns the spooler job id.  Used by both the web upload and the token
/// API's print endpoint; only the channel and submitter differ.
pub async fn submit_document(
    state: &AppState,
    submission: Submission,
    channel: SubmitChannel,
    submitter: &str,
) -> Result<i64, ServerError> {
    validate_upload(
        &submission.filename,
        submission.content.len(),
        state.config.max_upload_bytes,
    )?;

    tokio::fs::create_dir_all(&state.config.upload_dir)
        .await
        .map_err(|e| ServerError::Internal(format!("upload dir unavailable: {e}")))?;

    let safe_name = sanitize_filename(&submission.filename);
    let staged = state
        .config
        .upload_dir
        .join(format!("{}_{safe_name}", Uuid::new_v4()));
    tokio::fs::write(&staged, &submission.content)
        .await
        .map_err(|e| ServerError::Internal(format!("failed to stage upload: {e}")))?;

    let printable = state.converter.convert(&staged).await;
    let printer = submission
        .printer
        .as_deref()
        .unwrap_or(&state.config.printer_name);

    let job_id = state
        .spooler
        .submit(printer, &printable, &safe_name, &submission.options)
        .await?;

    // The ledger row is written after the spooler accepts the job.  A crash
    // between the two leaves an untracked job that reconciliation will
    // materialize as claimable on first sight.
    {
        let db = state.db.lock().expect("store mutex poisoned");
        db.record_submission(job_id, channel, Some(&safe_name), Some(submitter))?;
    }

    tracing::info!(job_id, file = %safe_name, %submitter, via = channel.as_str(), "document queued held");
    Ok(job_id)
}
