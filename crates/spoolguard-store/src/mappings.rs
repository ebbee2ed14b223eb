//! Identity mapping tables.
//!
//! Two independent admin-maintained override tables: spooler username to
//! platform username (device mappings) and email address to platform
//! username (email mappings).  No lifecycle beyond create/list/delete.

use rusqlite::{params, OptionalExtension};

use crate::database::{parse_dt, Database};
use crate::error::Result;
use crate::models::{DeviceMapping, EmailMapping};

impl Database {
    // ------------------------------------------------------------------
    // Device mappings
    // ------------------------------------------------------------------

    /// Create or replace the mapping for a spooler username.
    pub fn upsert_device_mapping(
        &self,
        spool_username: &str,
        platform_username: &str,
        auto_match: bool,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO device_mappings
             (spool_username, platform_username, auto_match, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                spool_username,
                platform_username,
                auto_match as i64,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Resolve a spooler username to a platform username.  Only mappings with
    /// `auto_match` set participate in reconciliation.
    pub fn device_mapping(&self, spool_username: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT platform_username FROM device_mappings
                 WHERE spool_username = ?1 AND auto_match = 1",
                params![spool_username],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// List all device mappings ordered by spooler username.
    pub fn list_device_mappings(&self) -> Result<Vec<DeviceMapping>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, spool_username, platform_username, auto_match, created_at
             FROM device_mappings
             ORDER BY spool_username ASC",
        )?;

        let rows = stmt.query_map([], row_to_device_mapping)?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?);
        }
        Ok(mappings)
    }

    /// Delete a device mapping by id.  Returns `true` if a row was removed.
    pub fn delete_device_mapping(&self, id: i64) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM device_mappings WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Email mappings
    // ------------------------------------------------------------------

    /// Create or replace the mapping for an email address (case-folded).
    pub fn upsert_email_mapping(&self, email: &str, platform_username: &str) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO email_mappings (email, platform_username, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                email.to_lowercase(),
                platform_username,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Resolve an email address (case-insensitively) to a platform username.
    pub fn email_mapping(&self, email: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT platform_username FROM email_mappings WHERE email = ?1",
                params![email.to_lowercase()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// List all email mappings ordered by address.
    pub fn list_email_mappings(&self) -> Result<Vec<EmailMapping>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, email, platform_username, created_at
             FROM email_mappings
             ORDER BY email ASC",
        )?;

        let rows = stmt.query_map([], row_to_email_mapping)?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?);
        }
        Ok(mappings)
    }

    /// Delete an email mapping by address.  Returns `true` if a row was removed.
    pub fn delete_email_mapping(&self, email: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM email_mappings WHERE email = ?1",
            params![email.to_lowercase()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_device_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceMapping> {
    let created_str: String = row.get(4)?;
    Ok(DeviceMapping {
        id: row.get(0)?,
        spool_username: row.get(1)?,
        platform_username: row.get(2)?,
        auto_match: row.get::<_, i64>(3)? != 0,
        created_at: parse_dt(4, &created_str)?,
    })
}

fn row_to_email_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmailMapping> {
    let created_str: String = row.get(3)?;
    Ok(EmailMapping {
        id: row.get(0)?,
        email: row.get(1)?,
        platform_username: row.get(2)?,
        created_at: parse_dt(3, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn device_mapping_round_trip() {
        let (_dir, db) = test_db();
        db.upsert_device_mapping("living-room-pc", "alice", true).unwrap();

        assert_eq!(db.device_mapping("living-room-pc").unwrap().as_deref(), Some("alice"));
        assert_eq!(db.device_mapping("unknown-box").unwrap(), None);

        // Replacing keeps the unique spooler-username key.
        db.upsert_device_mapping("living-room-pc", "bob", true).unwrap();
        assert_eq!(db.device_mapping("living-room-pc").unwrap().as_deref(), Some("bob"));
        assert_eq!(db.list_device_mappings().unwrap().len(), 1);
    }

    #[test]
    fn disabled_auto_match_does_not_resolve() {
        let (_dir, db) = test_db();
        db.upsert_device_mapping("shared-kiosk", "carol", false).unwrap();

        assert_eq!(db.device_mapping("shared-kiosk").unwrap(), None);
        // Still listed for the admin view.
        assert_eq!(db.list_device_mappings().unwrap().len(), 1);
    }

    #[test]
    fn email_mapping_is_case_folded() {
        let (_dir, db) = test_db();
        db.upsert_email_mapping("Alice@Example.COM", "alice").unwrap();

        assert_eq!(db.email_mapping("alice@example.com").unwrap().as_deref(), Some("alice"));
        assert_eq!(db.email_mapping("ALICE@example.com").unwrap().as_deref(), Some("alice"));

        assert!(db.delete_email_mapping("aLiCe@eXaMpLe.cOm").unwrap());
        assert_eq!(db.email_mapping("alice@example.com").unwrap(), None);
    }

    #[test]
    fn delete_device_mapping_by_id() {
        let (_dir, db) = test_db();
        db.upsert_device_mapping("printer-nook", "dave", true).unwrap();
        let id = db.list_device_mappings().unwrap()[0].id;

        assert!(db.delete_device_mapping(id).unwrap());
        assert!(!db.delete_device_mapping(id).unwrap());
    }
}
