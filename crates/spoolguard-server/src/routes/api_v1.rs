//! Token-authenticated API, mounted under `/api/v1`.
//!
//! Every endpoint except `/health` requires a bearer credential; responses
//! carry `X-RateLimit-Remaining` with the caller's minute budget.  Admin
//! endpoints also accept an admin browser session so the management UI does
//! not need a separate credential.

use axum::extract::{Multipart, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use spoolguard_store::{
    ApiKey, ClaimOutcome, DeviceMapping, EmailMapping, KioskDevice, Permission, SubmitChannel,
};

use crate::access::{Actor, Operation};
use crate::api::{
    key_or_admin_session, rate_limited_json, require_api_key, submit_document, AppState,
};
use crate::error::ServerError;
use crate::reconcile::EnrichedJob;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/unclaimed", get(list_unclaimed))
        .route("/jobs/:id", get(job_detail))
        .route("/jobs/:id/release", post(release_job))
        .route("/jobs/:id/cancel", post(cancel_job))
        .route("/jobs/:id/claim", post(claim_job))
        .route("/print", post(print_document))
        .route("/printer/status", get(printer_status))
        .route("/printers", get(list_printers))
        .route("/keys", get(list_keys).post(create_key))
        .route("/keys/:id", delete(delete_key))
        .route("/keys/:id/revoke", post(revoke_key))
        .route("/users", get(user_summary))
        .route("/mappings/devices", get(list_device_mappings).post(upsert_device_mapping))
        .route("/mappings/devices/:id", delete(delete_device_mapping))
        .route("/mappings/emails", get(list_email_mappings).post(upsert_email_mapping))
        .route("/mappings/emails/:email", delete(delete_email_mapping))
        .route("/kiosks", get(list_kiosks).post(create_kiosk))
        .route("/kiosks/:id", delete(delete_kiosk))
        .route("/kiosks/:id/deactivate", post(deactivate_kiosk))
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<Health> {
    Json(Health { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct JobFilter {
    /// Match the effective owner.
    user: Option<String>,
    /// Match the job state text, case-insensitively.
    state: Option<String>,
    /// `true` keeps only claimable jobs.
    unclaimed: Option<bool>,
}

impl JobFilter {
    fn matches(&self, job: &EnrichedJob) -> bool {
        if let Some(user) = &self.user {
            if job.effective_owner.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(state) = &self.state {
            if !job.state_text.eq_ignore_ascii_case(state) {
                return false;
            }
        }
        if self.unclaimed == Some(true) && !job.claimable {
            return false;
        }
        true
    }
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<JobFilter>,
) -> Result<Response, ServerError> {
    let (_, remaining) = require_api_key(&state, &headers, Permission::Read)?;

    let jobs: Vec<EnrichedJob> = state
        .reconciler
        .snapshot()
        .await
        .into_iter()
        .filter(|j| filter.matches(j))
        .collect();

    Ok(rate_limited_json(remaining, serde_json::json!({ "jobs": jobs })))
}

async fn list_unclaimed(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let (_, remaining) = require_api_key(&state, &headers, Permission::Read)?;

    let jobs: Vec<EnrichedJob> = state
        .reconciler
        .snapshot()
        .await
        .into_iter()
        .filter(|j| j.claimable)
        .collect();

    Ok(rate_limited_json(remaining, serde_json::json!({ "jobs": jobs })))
}

async fn job_detail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let (_, remaining) = require_api_key(&state, &headers, Permission::Read)?;
    let job = state.reconciler.job(id).await?;
    Ok(rate_limited_json(remaining, job))
}

async fn release_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let (key, remaining) = require_api_key(&state, &headers, Permission::Write)?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Credential(key.clone()), Operation::Release, &job)?;

    state.spooler.release(id).await?;
    tracing::info!(job_id = id, key = %key.name, "job released via API");
    Ok(rate_limited_json(remaining, serde_json::json!({ "released": id })))
}

async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let (key, remaining) = require_api_key(&state, &headers, Permission::Write)?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Credential(key.clone()), Operation::Cancel, &job)?;

    state.spooler.cancel(id).await?;
    tracing::info!(job_id = id, key = %key.name, "job canceled via API");
    Ok(rate_limited_json(remaining, serde_json::json!({ "canceled": id })))
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    /// The platform user the claim is made for; defaults to the key owner.
    username: Option<String>,
}

async fn claim_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    body: Option<Json<ClaimRequest>>,
) -> Result<Response, ServerError> {
    let (key, remaining) = require_api_key(&state, &headers, Permission::Write)?;

    let job = state.reconciler.job(id).await?;
    state.gate.authorize(&Actor::Credential(key.clone()), Operation::Claim, &job)?;

    let claimant = body
        .and_then(|Json(req)| req.username)
        .unwrap_or_else(|| key.owner.clone());

    let outcome = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.claim_job(id, &claimant)?
    };
    match outcome {
        ClaimOutcome::Claimed => {
            tracing::info!(job_id = id, %claimant, "job claimed via API");
            Ok(rate_limited_json(remaining, serde_json::json!({ "claimed": id, "by": claimant })))
        }
        ClaimOutcome::AlreadyClaimed { by } => Err(ServerError::AlreadyClaimed(by)),
    }
}

async fn print_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ServerError> {
    let (key, remaining) = require_api_key(&state, &headers, Permission::Write)?;

    let submission = crate::api::read_submission(multipart).await?;
    let job_id = submit_document(&state, submission, SubmitChannel::Api, &key.owner).await?;

    Ok(rate_limited_json(remaining, serde_json::json!({ "job_id": job_id, "held": true })))
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

async fn printer_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let (_, remaining) = require_api_key(&state, &headers, Permission::Read)?;

    let printers = state.spooler.printers().await?;
    let status = printers
        .into_iter()
        .find(|p| p.name == state.config.printer_name)
        .ok_or_else(|| ServerError::NotFound(format!("printer {}", state.config.printer_name)))?;

    Ok(rate_limited_json(remaining, status))
}

async fn list_printers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let (_, remaining) = require_api_key(&state, &headers, Permission::Read)?;
    let printers = state.spooler.printers().await?;
    Ok(rate_limited_json(remaining, serde_json::json!({ "printers": printers })))
}

// ---------------------------------------------------------------------------
// Credential management (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    owner: String,
    permissions: Vec<Permission>,
}

#[derive(Serialize)]
struct CreatedKey {
    /// Shown exactly once; only the hash is stored.
    key: String,
}

async fn create_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateKeyRequest>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;

    if req.name.trim().is_empty() || req.owner.trim().is_empty() {
        return Err(ServerError::Validation("name and owner are required".into()));
    }
    if req.permissions.is_empty() {
        return Err(ServerError::Validation("at least one permission is required".into()));
    }

    let raw = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.create_api_key(req.name.trim(), req.owner.trim(), &req.permissions)?
    };
    Ok(rate_limited_json(remaining, CreatedKey { key: raw }))
}

async fn list_keys(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let keys: Vec<ApiKey> = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.list_api_keys()?
    };
    Ok(rate_limited_json(remaining, serde_json::json!({ "keys": keys })))
}

async fn revoke_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    {
        let db = state.db.lock().expect("store mutex poisoned");
        db.revoke_api_key(id)?;
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "revoked": id })))
}

async fn delete_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let deleted = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.delete_api_key(id)?
    };
    if !deleted {
        return Err(ServerError::NotFound(format!("key {id}")));
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "deleted": id })))
}

// ---------------------------------------------------------------------------
// User aggregate (admin)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct UserJobs {
    user: String,
    job_count: usize,
    job_ids: Vec<i64>,
}

async fn user_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;

    let mut by_user: std::collections::BTreeMap<String, Vec<i64>> = Default::default();
    let mut unattributed = 0usize;
    for job in state.reconciler.snapshot().await {
        match &job.effective_owner {
            Some(owner) => by_user.entry(owner.clone()).or_default().push(job.job.id),
            None => unattributed += 1,
        }
    }

    let users: Vec<UserJobs> = by_user
        .into_iter()
        .map(|(user, job_ids)| UserJobs { job_count: job_ids.len(), user, job_ids })
        .collect();

    Ok(rate_limited_json(
        remaining,
        serde_json::json!({ "users": users, "unattributed": unattributed }),
    ))
}

// ---------------------------------------------------------------------------
// Identity mappings (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DeviceMappingRequest {
    spool_username: String,
    platform_username: String,
    #[serde(default = "default_true")]
    auto_match: bool,
}

fn default_true() -> bool {
    true
}

async fn list_device_mappings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let mappings: Vec<DeviceMapping> = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.list_device_mappings()?
    };
    Ok(rate_limited_json(remaining, serde_json::json!({ "mappings": mappings })))
}

async fn upsert_device_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeviceMappingRequest>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;

    if req.spool_username.trim().is_empty() || req.platform_username.trim().is_empty() {
        return Err(ServerError::Validation("both usernames are required".into()));
    }

    {
        let db = state.db.lock().expect("store mutex poisoned");
        db.upsert_device_mapping(
            req.spool_username.trim(),
            req.platform_username.trim(),
            req.auto_match,
        )?;
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "ok": true })))
}

async fn delete_device_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let deleted = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.delete_device_mapping(id)?
    };
    if !deleted {
        return Err(ServerError::NotFound(format!("device mapping {id}")));
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "deleted": id })))
}

#[derive(Debug, Deserialize)]
struct EmailMappingRequest {
    email: String,
    platform_username: String,
}

async fn list_email_mappings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let mappings: Vec<EmailMapping> = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.list_email_mappings()?
    };
    Ok(rate_limited_json(remaining, serde_json::json!({ "mappings": mappings })))
}

async fn upsert_email_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EmailMappingRequest>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;

    if !req.email.contains('@') || req.platform_username.trim().is_empty() {
        return Err(ServerError::Validation("a valid email and username are required".into()));
    }

    {
        let db = state.db.lock().expect("store mutex poisoned");
        db.upsert_email_mapping(req.email.trim(), req.platform_username.trim())?;
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "ok": true })))
}

async fn delete_email_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(email): Path<String>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let deleted = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.delete_email_mapping(&email)?
    };
    if !deleted {
        return Err(ServerError::NotFound(format!("email mapping {email}")));
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "deleted": email })))
}

// ---------------------------------------------------------------------------
// Kiosk device management (admin)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateKioskRequest {
    name: String,
    allowed_ip: Option<String>,
}

async fn create_kiosk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateKioskRequest>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;

    if req.name.trim().is_empty() {
        return Err(ServerError::Validation("a device name is required".into()));
    }

    let token = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.create_kiosk_device(req.name.trim(), req.allowed_ip.as_deref())?
    };
    // Shown exactly once, same as credential secrets.
    Ok(rate_limited_json(remaining, serde_json::json!({ "token": token })))
}

async fn list_kiosks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let devices: Vec<KioskDevice> = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.list_kiosk_devices()?
    };
    Ok(rate_limited_json(remaining, serde_json::json!({ "devices": devices })))
}

async fn deactivate_kiosk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    {
        let db = state.db.lock().expect("store mutex poisoned");
        db.deactivate_kiosk_device(id)?;
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "deactivated": id })))
}

async fn delete_kiosk(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Response, ServerError> {
    let remaining = key_or_admin_session(&state, &headers).await?;
    let deleted = {
        let db = state.db.lock().expect("store mutex poisoned");
        db.delete_kiosk_device(id)?
    };
    if !deleted {
        return Err(ServerError::NotFound(format!("kiosk device {id}")));
    }
    Ok(rate_limited_json(remaining, serde_json::json!({ "deleted": id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::spooler::{JobState, SpoolJob};

    fn enriched(id: i64, owner: Option<&str>, state: JobState, claimable: bool) -> EnrichedJob {
        EnrichedJob {
            job: SpoolJob {
                id,
                title: format!("doc-{id}"),
                originating_user: "x".into(),
                printer: "p".into(),
                state,
                pages: 1,
                size_kb: 1,
                created_at: Some(Utc::now()),
            },
            state_text: state.as_str(),
            submitted_via: SubmitChannel::Ipp,
            original_filename: None,
            claimed_by: None,
            effective_owner: owner.map(String::from),
            via_device_mapping: false,
            claimable,
        }
    }

    #[test]
    fn filter_by_user_state_and_unclaimed() {
        let jobs = [
            enriched(1, Some("alice"), JobState::Held, false),
            enriched(2, Some("bob"), JobState::Pending, false),
            enriched(3, None, JobState::Held, true),
        ];

        let by_user = JobFilter { user: Some("alice".into()), ..Default::default() };
        assert!(by_user.matches(&jobs[0]));
        assert!(!by_user.matches(&jobs[1]));

        // State matching is case-insensitive.
        let by_state = JobFilter { state: Some("held".into()), ..Default::default() };
        assert!(by_state.matches(&jobs[0]));
        assert!(!by_state.matches(&jobs[1]));

        let unclaimed = JobFilter { unclaimed: Some(true), ..Default::default() };
        assert!(!unclaimed.matches(&jobs[0]));
        assert!(unclaimed.matches(&jobs[2]));

        // No filters: everything passes.
        let all = JobFilter::default();
        assert!(jobs.iter().all(|j| all.matches(j)));
    }
}
