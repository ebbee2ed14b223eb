//! API key management: creation, validation, revocation.
//!
//! Raw secrets look like `pq_<43 base64url chars>`.  Only the SHA-256 hex of
//! the full secret and a short display prefix are persisted; the raw secret
//! is returned exactly once at creation time.

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::database::{parse_dt, Database};
use crate::error::Result;
use crate::models::{ApiKey, Permission};

/// Number of leading secret characters kept in plaintext for display.
const PREFIX_LEN: usize = 10;

/// Hash a raw bearer secret the way it is stored in the database.
pub(crate) fn hash_secret(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Generate `n` random bytes rendered as unpadded URL-safe base64.
pub(crate) fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl Database {
    /// Create a new API key and return the raw secret.
    ///
    /// The secret cannot be retrieved again; callers must surface it to the
    /// requesting admin immediately.
    pub fn create_api_key(
        &self,
        name: &str,
        owner: &str,
        permissions: &[Permission],
    ) -> Result<String> {
        let raw_key = format!("pq_{}", random_token(32));
        let key_hash = hash_secret(&raw_key);
        let key_prefix: String = raw_key.chars().take(PREFIX_LEN).collect();
        let perms_json = serde_json::to_string(permissions)
            .expect("permission serialization is infallible");

        self.conn().execute(
            "INSERT INTO api_keys (key_hash, key_prefix, name, owner, permissions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![key_hash, key_prefix, name, owner, perms_json, Utc::now().to_rfc3339()],
        )?;

        tracing::info!(name, owner, prefix = %key_prefix, "created API key");
        Ok(raw_key)
    }

    /// Validate a presented secret.
    ///
    /// On success the key's usage counter and last-used timestamp are bumped
    /// and the full record returned.  Unknown and revoked secrets are both
    /// reported as `None`; callers must not distinguish the two.
    pub fn validate_api_key(&self, raw_key: &str) -> Result<Option<ApiKey>> {
        let key_hash = hash_secret(raw_key);

        let key = self
            .conn()
            .query_row(
                "SELECT id, key_prefix, name, owner, permissions, created_at, last_used,
                        request_count, is_active
                 FROM api_keys
                 WHERE key_hash = ?1 AND is_active = 1",
                params![key_hash],
                row_to_api_key,
            )
            .optional()?;

        if key.is_some() {
            self.conn().execute(
                "UPDATE api_keys
                 SET last_used = ?1, request_count = request_count + 1
                 WHERE key_hash = ?2",
                params![Utc::now().to_rfc3339(), key_hash],
            )?;
        }

        Ok(key)
    }

    /// List all API keys, newest first.  Hashes are never returned.
    pub fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, key_prefix, name, owner, permissions, created_at, last_used,
                    request_count, is_active
             FROM api_keys
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map([], row_to_api_key)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Revoke a key.  Idempotent; the row is kept for audit history and
    /// there is no re-activation path.
    pub fn revoke_api_key(&self, key_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE api_keys SET is_active = 0 WHERE id = ?1",
            params![key_id],
        )?;
        tracing::info!(key_id, "revoked API key");
        Ok(())
    }

    /// Hard-delete a key record.  Returns `true` if a row was removed.
    pub fn delete_api_key(&self, key_id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM api_keys WHERE id = ?1", params![key_id])?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to an [`ApiKey`].
fn row_to_api_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKey> {
    let perms_json: String = row.get(4)?;
    let permissions: Vec<Permission> = serde_json::from_str(&perms_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_str: String = row.get(5)?;
    let last_used_str: Option<String> = row.get(6)?;

    let created_at = parse_dt(5, &created_str)?;
    let last_used: Option<DateTime<Utc>> = match last_used_str {
        Some(s) => Some(parse_dt(6, &s)?),
        None => None,
    };

    Ok(ApiKey {
        id: row.get(0)?,
        key_prefix: row.get(1)?,
        name: row.get(2)?,
        owner: row.get(3)?,
        permissions,
        created_at,
        last_used,
        request_count: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
    })
}
