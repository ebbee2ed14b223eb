//! Kiosk device token management.
//!
//! Mirrors the API key flow: a raw token `kiosk_<base64url>` is generated
//! once and only its hash is stored.  Validation additionally honours an
//! optional per-device IP restriction.  Registration tokens are not
//! invalidated after first use; the backing record is reusable across
//! kiosk cookie losses.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_dt, Database};
use crate::error::Result;
use crate::keys::{hash_secret, random_token};
use crate::models::KioskDevice;

impl Database {
    /// Register a kiosk device and return the raw token (shown once).
    pub fn create_kiosk_device(&self, name: &str, allowed_ip: Option<&str>) -> Result<String> {
        let raw_token = format!("kiosk_{}", random_token(48));
        let token_hash = hash_secret(&raw_token);

        self.conn().execute(
            "INSERT INTO kiosk_devices (name, token_hash, allowed_ip, registered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, token_hash, allowed_ip, Utc::now().to_rfc3339()],
        )?;

        tracing::info!(name, restricted = allowed_ip.is_some(), "registered kiosk device");
        Ok(raw_token)
    }

    /// Validate a kiosk token, optionally against the caller's IP.
    ///
    /// The IP check is advisory defense-in-depth: a hash match with a
    /// mismatched IP still yields `None`.  Updates `last_seen` on success.
    pub fn validate_kiosk_token(
        &self,
        raw_token: &str,
        client_ip: Option<&str>,
    ) -> Result<Option<KioskDevice>> {
        let token_hash = hash_secret(raw_token);

        let device = self
            .conn()
            .query_row(
                "SELECT id, name, allowed_ip, is_active, registered_at, last_seen
                 FROM kiosk_devices
                 WHERE token_hash = ?1 AND is_active = 1",
                params![token_hash],
                row_to_kiosk,
            )
            .optional()?;

        let Some(device) = device else {
            return Ok(None);
        };

        if let (Some(allowed), Some(actual)) = (device.allowed_ip.as_deref(), client_ip) {
            if allowed != actual {
                tracing::warn!(
                    device = %device.name,
                    ip = actual,
                    "kiosk token presented from disallowed IP"
                );
                return Ok(None);
            }
        }

        self.conn().execute(
            "UPDATE kiosk_devices SET last_seen = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), device.id],
        )?;

        Ok(Some(device))
    }

    /// List all kiosk devices, newest first.
    pub fn list_kiosk_devices(&self) -> Result<Vec<KioskDevice>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, name, allowed_ip, is_active, registered_at, last_seen
             FROM kiosk_devices
             ORDER BY registered_at DESC",
        )?;

        let rows = stmt.query_map([], row_to_kiosk)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    /// Deactivate a kiosk device (token stops validating; record kept).
    pub fn deactivate_kiosk_device(&self, device_id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE kiosk_devices SET is_active = 0 WHERE id = ?1",
            params![device_id],
        )?;
        Ok(())
    }

    /// Hard-delete a kiosk device record.
    pub fn delete_kiosk_device(&self, device_id: i64) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM kiosk_devices WHERE id = ?1",
            params![device_id],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_kiosk(row: &rusqlite::Row<'_>) -> rusqlite::Result<KioskDevice> {
    let registered_str: String = row.get(4)?;
    let last_seen_str: Option<String> = row.get(5)?;

    let registered_at = parse_dt(4, &registered_str)?;
    let last_seen: Option<DateTime<Utc>> = match last_seen_str {
        Some(s) => Some(parse_dt(5, &s)?),
        None => None,
    };

    Ok(KioskDevice {
        id: row.get(0)?,
        name: row.get(1)?,
        allowed_ip: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        registered_at,
        last_seen,
    })
}
