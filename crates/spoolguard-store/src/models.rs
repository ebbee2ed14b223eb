//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` so it can be handed directly to the HTTP
//! layer.  Raw secrets never appear here: `ApiKey` and `KioskDevice` carry
//! only display-safe fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Permission
// ---------------------------------------------------------------------------

/// A credential permission tier.
///
/// Tiers are hierarchical by convention only (`Admin` implies `Write` implies
/// `Read`); every authorization check enumerates the tiers that satisfy it
/// explicitly rather than relying on ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    /// Parse a stored tier token.  Unknown tokens are rejected rather than
    /// silently granting nothing.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SubmitChannel
// ---------------------------------------------------------------------------

/// The front door a print job arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitChannel {
    /// Received by the spooler directly from a driver or device; the only
    /// channel that can be genuinely anonymous.
    Ipp,
    Web,
    Api,
    Email,
}

impl SubmitChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmitChannel::Ipp => "ipp",
            SubmitChannel::Web => "web",
            SubmitChannel::Api => "api",
            SubmitChannel::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ipp" => Some(SubmitChannel::Ipp),
            "web" => Some(SubmitChannel::Web),
            "api" => Some(SubmitChannel::Api),
            "email" => Some(SubmitChannel::Email),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

/// A stored API key.  The raw secret is shown once at creation and only its
/// hash is persisted; `key_prefix` exists for display purposes.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKey {
    pub id: i64,
    pub key_prefix: String,
    pub name: String,
    pub owner: String,
    pub permissions: Vec<Permission>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub request_count: i64,
    pub is_active: bool,
}

impl ApiKey {
    /// Whether this key carries the given tier token itself (no hierarchy).
    pub fn has(&self, p: Permission) -> bool {
        self.permissions.contains(&p)
    }
}

// ---------------------------------------------------------------------------
// KioskDevice
// ---------------------------------------------------------------------------

/// A registered kiosk display device.
#[derive(Debug, Clone, Serialize)]
pub struct KioskDevice {
    pub id: i64,
    pub name: String,
    /// Advisory IP restriction; when set, token validation also requires the
    /// caller's IP to match.
    pub allowed_ip: Option<String>,
    pub is_active: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// JobMeta
// ---------------------------------------------------------------------------

/// Submission metadata and claim state for a spooler job.
///
/// A row with both `submitted_by` and `claimed_by` NULL denotes an unclaimed
/// job.  Claiming sets both fields to the claimant.
#[derive(Debug, Clone, Serialize)]
pub struct JobMeta {
    pub id: i64,
    pub job_id: i64,
    pub submitted_via: SubmitChannel,
    pub original_filename: Option<String>,
    pub submitted_by: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobMeta {
    pub fn is_unclaimed(&self) -> bool {
        self.submitted_by.is_none() && self.claimed_by.is_none()
    }
}

/// Outcome of a claim attempt.  Claim is first-writer-wins; losing the race
/// is a normal conflict, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed { by: String },
}

// ---------------------------------------------------------------------------
// Identity mappings
// ---------------------------------------------------------------------------

/// Admin-declared mapping from a spooler originating-user string to a
/// platform identity.  A matching mapping wins over any claim.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceMapping {
    pub id: i64,
    pub spool_username: String,
    pub platform_username: String,
    pub auto_match: bool,
    pub created_at: DateTime<Utc>,
}

/// Mapping from a (case-folded) email address to a platform identity, used
/// by the inbound-email ingress.
#[derive(Debug, Clone, Serialize)]
pub struct EmailMapping {
    pub id: i64,
    pub email: String,
    pub platform_username: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_round_trip() {
        for p in [Permission::Read, Permission::Write, Permission::Admin] {
            assert_eq!(Permission::parse(p.as_str()), Some(p));
        }
        assert_eq!(Permission::parse("root"), None);
        assert_eq!(Permission::parse("READ"), None);
    }

    #[test]
    fn channel_round_trip() {
        for c in [
            SubmitChannel::Ipp,
            SubmitChannel::Web,
            SubmitChannel::Api,
            SubmitChannel::Email,
        ] {
            assert_eq!(SubmitChannel::parse(c.as_str()), Some(c));
        }
        assert_eq!(SubmitChannel::parse("fax"), None);
    }
}
