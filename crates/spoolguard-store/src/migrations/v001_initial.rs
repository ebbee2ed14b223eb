//! v001 -- Initial schema creation.
//!
//! Creates the six core tables: `api_keys`, `kiosk_devices`, `job_meta`,
//! `device_mappings`, `email_mappings`, and `rate_windows`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- API keys (long-lived bearer credentials; secret stored hashed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS api_keys (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    key_hash      TEXT NOT NULL UNIQUE,        -- SHA-256 hex of the raw secret
    key_prefix    TEXT NOT NULL,               -- first chars, display only
    name          TEXT NOT NULL,
    owner         TEXT NOT NULL,
    permissions   TEXT NOT NULL,               -- JSON array of tiers
    created_at    TEXT NOT NULL,               -- RFC-3339
    last_used     TEXT,
    request_count INTEGER NOT NULL DEFAULT 0,
    is_active     INTEGER NOT NULL DEFAULT 1   -- boolean 0/1
);

-- ----------------------------------------------------------------
-- Kiosk devices (registration tokens; secret stored hashed)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS kiosk_devices (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT NOT NULL,
    token_hash    TEXT NOT NULL UNIQUE,
    allowed_ip    TEXT,                        -- advisory restriction
    is_active     INTEGER NOT NULL DEFAULT 1,
    registered_at TEXT NOT NULL,
    last_seen     TEXT
);

-- ----------------------------------------------------------------
-- Job metadata ledger (zero or one row per spooler job id)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS job_meta (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id            INTEGER NOT NULL UNIQUE,  -- spooler-assigned id
    submitted_via     TEXT NOT NULL DEFAULT 'ipp',
    original_filename TEXT,
    submitted_by      TEXT,                     -- platform identity
    claimed_by        TEXT,
    claimed_at        TEXT,
    created_at        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_meta_unclaimed
    ON job_meta(claimed_by, submitted_by);

-- ----------------------------------------------------------------
-- Device mappings (spooler username -> platform username)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS device_mappings (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    spool_username    TEXT NOT NULL UNIQUE,
    platform_username TEXT NOT NULL,
    auto_match        INTEGER NOT NULL DEFAULT 1,
    created_at        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Email mappings (case-folded email -> platform username)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS email_mappings (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    email             TEXT NOT NULL UNIQUE,
    platform_username TEXT NOT NULL,
    created_at        TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Rate windows (one row per credential per wall-clock minute)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS rate_windows (
    key_hash      TEXT NOT NULL,
    window_start  TEXT NOT NULL,               -- minute-truncated RFC-3339
    request_count INTEGER NOT NULL DEFAULT 1,

    PRIMARY KEY (key_hash, window_start)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
