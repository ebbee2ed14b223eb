//! Job metadata ledger: submission records and the claim state machine.
//!
//! One row at most per spooler job id.  Rows are written eagerly by the
//! ingress adapters (web/api/email) and lazily by the reconciler when it
//! first sights an untracked spooler job.  A row with both `submitted_by`
//! and `claimed_by` NULL is an unclaimed job anyone may claim.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::{parse_dt, Database};
use crate::error::{Result, StoreError};
use crate::models::{ClaimOutcome, JobMeta, SubmitChannel};

impl Database {
    /// Record submission metadata for a spooler job.  Insert-only; called
    /// once per ingress submission right after the spooler accepts the job.
    pub fn record_submission(
        &self,
        job_id: i64,
        via: SubmitChannel,
        original_filename: Option<&str>,
        submitted_by: Option<&str>,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO job_meta (job_id, submitted_via, original_filename, submitted_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job_id,
                via.as_str(),
                original_filename,
                submitted_by,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Fetch the ledger row for a spooler job, if any.
    pub fn get_job_meta(&self, job_id: i64) -> Result<Option<JobMeta>> {
        self.conn()
            .query_row(
                "SELECT id, job_id, submitted_via, original_filename, submitted_by,
                        claimed_by, claimed_at, created_at
                 FROM job_meta
                 WHERE job_id = ?1",
                params![job_id],
                row_to_job_meta,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Claim a job for `claimant`.  First-writer-wins: the claim is one
    /// guarded upsert, so concurrent claimants serialize inside SQLite and
    /// the loser's statement changes nothing.  There is no re-claim or
    /// transfer operation.  Claiming binds both identity fields.
    pub fn claim_job(&self, job_id: i64, claimant: &str) -> Result<ClaimOutcome> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "INSERT INTO job_meta
             (job_id, submitted_via, submitted_by, claimed_by, claimed_at, created_at)
             VALUES (?1, 'ipp', ?2, ?2, ?3, ?3)
             ON CONFLICT(job_id) DO UPDATE
             SET claimed_by = excluded.claimed_by,
                 submitted_by = excluded.submitted_by,
                 claimed_at = excluded.claimed_at
             WHERE job_meta.claimed_by IS NULL",
            params![job_id, claimant, now],
        )?;

        if changed == 1 {
            tracing::info!(job_id, claimant, "job claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        let by = self.claimed_owner(job_id)?.ok_or_else(|| {
            StoreError::Corrupt(format!("claim upsert for job {job_id} changed no row"))
        })?;
        Ok(ClaimOutcome::AlreadyClaimed { by })
    }

    /// Job ids with no recorded submitter and no claimant.
    pub fn unclaimed_job_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn().prepare(
            "SELECT job_id FROM job_meta
             WHERE claimed_by IS NULL AND submitted_by IS NULL",
        )?;

        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// The claimant of a job, if it has one.
    pub fn claimed_owner(&self, job_id: i64) -> Result<Option<String>> {
        let owner: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT claimed_by FROM job_meta WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.flatten())
    }

    /// Delete ledger rows for ipp-channel jobs that stayed unclaimed past the
    /// timeout.  Returns the affected job ids.
    ///
    /// Metadata-only: the underlying spooler job is untouched and will be
    /// re-discovered (and re-tracked) by the next reconciliation pass.
    pub fn cleanup_expired_unclaimed(&self, timeout_hours: i64) -> Result<Vec<i64>> {
        let cutoff = Utc::now() - Duration::hours(timeout_hours);

        let tx = self.conn().unchecked_transaction()?;

        let mut expired = Vec::new();
        {
            let mut stmt = tx.prepare(
                "SELECT job_id FROM job_meta
                 WHERE claimed_by IS NULL AND submitted_via = 'ipp' AND created_at < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff.to_rfc3339()], |row| row.get(0))?;
            for row in rows {
                expired.push(row?);
            }
        }

        for job_id in &expired {
            tx.execute("DELETE FROM job_meta WHERE job_id = ?1", params![job_id])?;
        }

        tx.commit()?;

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "swept expired unclaimed job metadata");
        }
        Ok(expired)
    }
}

fn row_to_job_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobMeta> {
    let via_str: String = row.get(2)?;
    let submitted_via = SubmitChannel::parse(&via_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown submission channel: {via_str}").into(),
        )
    })?;

    let claimed_at_str: Option<String> = row.get(6)?;
    let created_str: String = row.get(7)?;

    let claimed_at: Option<DateTime<Utc>> = match claimed_at_str {
        Some(s) => Some(parse_dt(6, &s)?),
        None => None,
    };

    Ok(JobMeta {
        id: row.get(0)?,
        job_id: row.get(1)?,
        submitted_via,
        original_filename: row.get(3)?,
        submitted_by: row.get(4)?,
        claimed_by: row.get(5)?,
        claimed_at,
        created_at: parse_dt(7, &created_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn eager_submission_is_not_unclaimed() {
        let (_dir, db) = test_db();
        db.record_submission(7, SubmitChannel::Web, Some("report.pdf"), Some("alice"))
            .unwrap();

        let meta = db.get_job_meta(7).unwrap().unwrap();
        assert_eq!(meta.submitted_via, SubmitChannel::Web);
        assert_eq!(meta.submitted_by.as_deref(), Some("alice"));
        assert!(!meta.is_unclaimed());
        assert!(db.unclaimed_job_ids().unwrap().is_empty());
    }

    #[test]
    fn claim_flow_email_job() {
        // Job 42 arrives via email with no resolved submitter.
        let (_dir, db) = test_db();
        db.record_submission(42, SubmitChannel::Email, Some("scan.pdf"), None)
            .unwrap();

        assert_eq!(db.unclaimed_job_ids().unwrap(), vec![42]);

        assert_eq!(db.claim_job(42, "alice").unwrap(), ClaimOutcome::Claimed);
        assert!(db.unclaimed_job_ids().unwrap().is_empty());
        assert_eq!(db.claimed_owner(42).unwrap().as_deref(), Some("alice"));

        // Claiming set both identity fields.
        let meta = db.get_job_meta(42).unwrap().unwrap();
        assert_eq!(meta.submitted_by.as_deref(), Some("alice"));
        assert!(meta.claimed_at.is_some());
    }

    #[test]
    fn claim_is_first_writer_wins() {
        let (_dir, db) = test_db();
        db.record_submission(9, SubmitChannel::Ipp, None, None).unwrap();

        assert_eq!(db.claim_job(9, "alice").unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            db.claim_job(9, "bob").unwrap(),
            ClaimOutcome::AlreadyClaimed { by: "alice".into() }
        );
        // The loser did not disturb the winner's claim.
        assert_eq!(db.claimed_owner(9).unwrap().as_deref(), Some("alice"));
    }

    #[test]
    fn concurrent_claims_yield_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        {
            let db = Database::open_at(&path).unwrap();
            db.record_submission(1, SubmitChannel::Ipp, None, None).unwrap();
        }

        let path_a = path.clone();
        let path_b = path.clone();
        let a = std::thread::spawn(move || {
            let db = Database::open_at(&path_a).unwrap();
            db.claim_job(1, "alice").unwrap()
        });
        let b = std::thread::spawn(move || {
            let db = Database::open_at(&path_b).unwrap();
            db.claim_job(1, "bob").unwrap()
        });

        let outcomes = [a.join().unwrap(), b.join().unwrap()];
        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, ClaimOutcome::Claimed))
            .count();
        assert_eq!(wins, 1, "exactly one concurrent claim must win");
    }

    #[test]
    fn claiming_untracked_job_creates_row() {
        let (_dir, db) = test_db();
        assert_eq!(db.claim_job(55, "carol").unwrap(), ClaimOutcome::Claimed);

        let meta = db.get_job_meta(55).unwrap().unwrap();
        assert_eq!(meta.submitted_via, SubmitChannel::Ipp);
        assert_eq!(meta.claimed_by.as_deref(), Some("carol"));
    }

    #[test]
    fn expiry_sweep_spares_claimed_rows() {
        let (_dir, db) = test_db();
        db.record_submission(100, SubmitChannel::Ipp, None, None).unwrap();
        db.record_submission(101, SubmitChannel::Ipp, None, None).unwrap();
        db.record_submission(102, SubmitChannel::Web, None, Some("dave")).unwrap();
        db.claim_job(101, "erin").unwrap();

        // Age all three rows to 25 hours old.
        let old = (Utc::now() - Duration::hours(25)).to_rfc3339();
        db.conn()
            .execute("UPDATE job_meta SET created_at = ?1", params![old])
            .unwrap();

        let expired = db.cleanup_expired_unclaimed(24).unwrap();
        assert_eq!(expired, vec![100]);

        assert!(db.get_job_meta(100).unwrap().is_none());
        assert!(db.get_job_meta(101).unwrap().is_some()); // claimed, untouched
        assert!(db.get_job_meta(102).unwrap().is_some()); // non-ipp, untouched
    }

    #[test]
    fn fresh_unclaimed_rows_survive_the_sweep() {
        let (_dir, db) = test_db();
        db.record_submission(5, SubmitChannel::Ipp, None, None).unwrap();
        assert!(db.cleanup_expired_unclaimed(24).unwrap().is_empty());
        assert!(db.get_job_meta(5).unwrap().is_some());
    }
}
