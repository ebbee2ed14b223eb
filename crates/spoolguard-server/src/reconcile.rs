//! Ownership reconciliation.
//!
//! Runs on every read path, never cached: the live spooler queue is merged
//! with the metadata ledger and the identity mapping tables to answer, per
//! job, "which platform identity owns this, and may it still be claimed".
//!
//! Trust order for the effective owner:
//! 1. an admin-declared device mapping for the job's originating user wins
//!    unconditionally;
//! 2. a recorded claim;
//! 3. the submitter recorded eagerly by a web/api/email ingress adapter;
//! 4. otherwise the job is claimable, provisionally attributed to the
//!    spooler's low-trust originating-user string.
//!
//! Jobs observed with no ledger row at all get one materialized on the spot
//! (`submitted_via='ipp'`), which also absorbs ingress adapters that crashed
//! between spooler submission and their ledger write.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use spoolguard_store::{Database, JobMeta, SubmitChannel};

use crate::error::ServerError;
use crate::spooler::{SpoolJob, Spooler};

/// A spooler job enriched with ledger metadata and ownership resolution.
#[derive(Debug, Clone, Serialize)]
pub struct EnrichedJob {
    #[serde(flatten)]
    pub job: SpoolJob,
    pub state_text: &'static str,
    pub submitted_via: SubmitChannel,
    pub original_filename: Option<String>,
    pub claimed_by: Option<String>,
    /// The platform identity this job is attributed to, `None` only when the
    /// provisional originating-user string is empty.
    pub effective_owner: Option<String>,
    /// Whether the owner attribution came from a device mapping.
    pub via_device_mapping: bool,
    /// Whether any authenticated user may still claim this job.
    pub claimable: bool,
}

/// The per-requester view buckets.  A job lands in exactly one bucket.
#[derive(Debug, Clone, Serialize)]
pub struct Partition {
    pub mine: Vec<EnrichedJob>,
    pub mine_via_device: Vec<EnrichedJob>,
    pub unclaimed: Vec<EnrichedJob>,
    pub not_mine: Vec<EnrichedJob>,
}

/// Recomputes ownership against live spooler state on demand.
///
/// Kept behind its own type (rather than inlined into routes) so a bounded
/// cache could later slot in without touching the access gate.
pub struct Reconciler {
    spooler: Arc<dyn Spooler>,
    db: Arc<Mutex<Database>>,
}

impl Reconciler {
    pub fn new(spooler: Arc<dyn Spooler>, db: Arc<Mutex<Database>>) -> Self {
        Self { spooler, db }
    }

    /// Reconcile the full live queue, sorted newest first (ties broken by
    /// job id, descending -- spooler ids are monotonic).
    ///
    /// A spooler listing failure degrades to an empty snapshot; callers
    /// cannot distinguish "no jobs" from "spooler down" here, so the failure
    /// is logged loudly server-side.
    pub async fn snapshot(&self) -> Vec<EnrichedJob> {
        let jobs = match self.spooler.jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, "spooler listing failed, returning empty snapshot");
                return Vec::new();
            }
        };

        let mut enriched: Vec<EnrichedJob> = Vec::with_capacity(jobs.len());
        {
            let db = self.db.lock().expect("store mutex poisoned");
            for job in jobs.into_values() {
                match resolve(&db, job) {
                    Ok(job) => enriched.push(job),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to resolve job ownership, skipping");
                    }
                }
            }
        }

        enriched.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.job.id.cmp(&a.job.id))
        });
        enriched
    }

    /// Reconcile a single job by id.
    pub async fn job(&self, job_id: i64) -> Result<EnrichedJob, ServerError> {
        let mut jobs = self.spooler.jobs().await?;
        let job = jobs.remove(&job_id).ok_or(ServerError::JobNotFound(job_id))?;

        let db = self.db.lock().expect("store mutex poisoned");
        resolve(&db, job)
    }

    /// Split a snapshot into the requester's view buckets.
    pub fn partition(snapshot: Vec<EnrichedJob>, requester: &str) -> Partition {
        let mut p = Partition {
            mine: Vec::new(),
            mine_via_device: Vec::new(),
            unclaimed: Vec::new(),
            not_mine: Vec::new(),
        };

        for job in snapshot {
            let owned = job.effective_owner.as_deref() == Some(requester);
            if owned && job.via_device_mapping {
                p.mine_via_device.push(job);
            } else if owned {
                p.mine.push(job);
            } else if job.claimable {
                p.unclaimed.push(job);
            } else {
                p.not_mine.push(job);
            }
        }

        p
    }
}

/// Resolve one job's ownership, lazily materializing its ledger row on first
/// sight.  Idempotent: a second observation finds the row from the first.
fn resolve(db: &Database, job: SpoolJob) -> Result<EnrichedJob, ServerError> {
    // Step 1: admin-declared device mapping wins unconditionally.
    if let Some(platform_user) = db.device_mapping(&job.originating_user)? {
        let meta = db.get_job_meta(job.id)?;
        return Ok(enrich(job, meta, Some(platform_user), true, false));
    }

    let meta = match db.get_job_meta(job.id)? {
        Some(meta) => meta,
        None => {
            // First sight of an untracked job: materialize its ledger row so
            // every job ends up with exactly one, even when no ingress
            // adapter touched it.
            tracing::debug!(job_id = job.id, user = %job.originating_user, "first sight of untracked job");
            db.record_submission(
                job.id,
                SubmitChannel::Ipp,
                None,
                Some(&job.originating_user),
            )?;
            db.get_job_meta(job.id)?
                .ok_or_else(|| ServerError::Internal("ledger row vanished after insert".into()))?
        }
    };

    // Step 2: a claim binds ownership.
    if let Some(claimant) = meta.claimed_by.clone() {
        return Ok(enrich(job, Some(meta), Some(claimant), false, false));
    }

    // Step 3: an eager ingress registration (web/api/email) is trusted; the
    // ipp channel's submitted_by is only the spooler's low-trust string.
    if meta.submitted_via != SubmitChannel::Ipp {
        if let Some(submitter) = meta.submitted_by.clone() {
            return Ok(enrich(job, Some(meta), Some(submitter), false, false));
        }
    }

    // Step 4: claimable, provisionally attributed to the originating user.
    let provisional = if job.originating_user.is_empty() || job.originating_user == "Unknown" {
        None
    } else {
        Some(job.originating_user.clone())
    };
    Ok(enrich(job, Some(meta), provisional, false, true))
}

fn enrich(
    job: SpoolJob,
    meta: Option<JobMeta>,
    effective_owner: Option<String>,
    via_device_mapping: bool,
    claimable: bool,
) -> EnrichedJob {
    let state_text = job.state.as_str();
    EnrichedJob {
        state_text,
        submitted_via: meta
            .as_ref()
            .map(|m| m.submitted_via)
            .unwrap_or(SubmitChannel::Ipp),
        original_filename: meta.as_ref().and_then(|m| m.original_filename.clone()),
        claimed_by: meta.and_then(|m| m.claimed_by),
        effective_owner,
        via_device_mapping,
        claimable,
        job,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use crate::spooler::{JobState, PrintOptions, PrinterStatus};

    /// Spooler stub serving a fixed job set; `fail_listing` simulates an
    /// unreachable spooler.
    struct MockSpooler {
        jobs: Vec<SpoolJob>,
        fail_listing: bool,
    }

    #[async_trait]
    impl Spooler for MockSpooler {
        async fn submit(
            &self,
            _printer: &str,
            _path: &std::path::Path,
            _title: &str,
            _options: &PrintOptions,
        ) -> Result<i64, ServerError> {
            unimplemented!("not used by reconciler tests")
        }

        async fn jobs(&self) -> Result<HashMap<i64, SpoolJob>, ServerError> {
            if self.fail_listing {
                return Err(ServerError::Upstream("connection refused".into()));
            }
            Ok(self.jobs.iter().map(|j| (j.id, j.clone())).collect())
        }

        async fn release(&self, _job_id: i64) -> Result<(), ServerError> {
            Ok(())
        }

        async fn cancel(&self, _job_id: i64) -> Result<(), ServerError> {
            Ok(())
        }

        async fn printers(&self) -> Result<Vec<PrinterStatus>, ServerError> {
            Ok(Vec::new())
        }
    }

    fn spool_job(id: i64, user: &str, minute: u32) -> SpoolJob {
        SpoolJob {
            id,
            title: format!("doc-{id}"),
            originating_user: user.to_string(),
            printer: "HP_Smart_Tank_515".to_string(),
            state: JobState::Held,
            pages: 1,
            size_kb: 12,
            created_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, minute, 0).unwrap()),
        }
    }

    fn setup(jobs: Vec<SpoolJob>) -> (tempfile::TempDir, Arc<Mutex<Database>>, Reconciler) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("test.db")).unwrap(),
        ));
        let reconciler = Reconciler::new(
            Arc::new(MockSpooler { jobs, fail_listing: false }),
            db.clone(),
        );
        (dir, db, reconciler)
    }

    #[tokio::test]
    async fn lazy_materialization_is_idempotent() {
        let (_dir, db, reconciler) = setup(vec![spool_job(1, "shared-pc", 0)]);

        reconciler.snapshot().await;
        reconciler.snapshot().await;

        let db = db.lock().unwrap();
        let meta = db.get_job_meta(1).unwrap().expect("row materialized");
        assert_eq!(meta.submitted_via, SubmitChannel::Ipp);
        assert_eq!(meta.submitted_by.as_deref(), Some("shared-pc"));

        let rows: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM job_meta", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn device_mapping_wins_over_claim() {
        let (_dir, db, reconciler) = setup(vec![spool_job(2, "kitchen-tablet", 0)]);
        {
            let db = db.lock().unwrap();
            db.upsert_device_mapping("kitchen-tablet", "alice", true).unwrap();
            // Bob claimed it, but the admin-declared mapping is stronger.
            db.record_submission(2, SubmitChannel::Ipp, None, None).unwrap();
            db.claim_job(2, "bob").unwrap();
        }

        let snapshot = reconciler.snapshot().await;
        assert_eq!(snapshot[0].effective_owner.as_deref(), Some("alice"));
        assert!(snapshot[0].via_device_mapping);
        assert!(!snapshot[0].claimable);
    }

    #[tokio::test]
    async fn claim_beats_ipp_provisional_owner() {
        let (_dir, db, reconciler) = setup(vec![spool_job(3, "shared-pc", 0)]);

        // First sight: claimable, provisionally the shared device string.
        let snapshot = reconciler.snapshot().await;
        assert!(snapshot[0].claimable);
        assert_eq!(snapshot[0].effective_owner.as_deref(), Some("shared-pc"));

        db.lock().unwrap().claim_job(3, "carol").unwrap();

        let snapshot = reconciler.snapshot().await;
        assert_eq!(snapshot[0].effective_owner.as_deref(), Some("carol"));
        assert!(!snapshot[0].claimable);
    }

    #[tokio::test]
    async fn eager_ingress_submitter_owns_job() {
        let (_dir, db, reconciler) = setup(vec![spool_job(4, "printserver", 0)]);
        db.lock()
            .unwrap()
            .record_submission(4, SubmitChannel::Web, Some("cv.pdf"), Some("dave"))
            .unwrap();

        let snapshot = reconciler.snapshot().await;
        assert_eq!(snapshot[0].effective_owner.as_deref(), Some("dave"));
        assert_eq!(snapshot[0].original_filename.as_deref(), Some("cv.pdf"));
        assert!(!snapshot[0].claimable);
    }

    #[tokio::test]
    async fn anonymous_email_job_is_claimable() {
        let (_dir, db, reconciler) = setup(vec![spool_job(5, "printserver", 0)]);
        db.lock()
            .unwrap()
            .record_submission(5, SubmitChannel::Email, Some("scan.pdf"), None)
            .unwrap();

        let snapshot = reconciler.snapshot().await;
        assert!(snapshot[0].claimable);
    }

    #[tokio::test]
    async fn partition_covers_every_job_exactly_once() {
        let (_dir, db, reconciler) = setup(vec![
            spool_job(10, "alice", 0),       // provisionally alice's
            spool_job(11, "den-laptop", 1),  // device-mapped to alice
            spool_job(12, "shared-pc", 2),   // claimable
            spool_job(13, "printserver", 3), // web job owned by bob
        ]);
        {
            let db = db.lock().unwrap();
            db.upsert_device_mapping("den-laptop", "alice", true).unwrap();
            db.record_submission(13, SubmitChannel::Web, None, Some("bob")).unwrap();
        }

        let snapshot = reconciler.snapshot().await;
        assert_eq!(snapshot.len(), 4);

        let p = Reconciler::partition(snapshot, "alice");
        let ids = |v: &Vec<EnrichedJob>| v.iter().map(|j| j.job.id).collect::<Vec<_>>();
        assert_eq!(ids(&p.mine), vec![10]);
        assert_eq!(ids(&p.mine_via_device), vec![11]);
        assert_eq!(ids(&p.unclaimed), vec![12]);
        assert_eq!(ids(&p.not_mine), vec![13]);

        // Union covers all jobs, each exactly once.
        let total = p.mine.len() + p.mine_via_device.len() + p.unclaimed.len() + p.not_mine.len();
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn snapshot_sorts_newest_first_with_id_tiebreak() {
        let mut same_time = spool_job(21, "a", 5);
        same_time.created_at = spool_job(22, "a", 5).created_at;
        let (_dir, _db, reconciler) = setup(vec![
            spool_job(20, "a", 1),
            same_time,
            spool_job(22, "a", 5),
            spool_job(23, "a", 9),
        ]);

        let snapshot = reconciler.snapshot().await;
        let ids: Vec<i64> = snapshot.iter().map(|j| j.job.id).collect();
        assert_eq!(ids, vec![23, 22, 21, 20]);
    }

    #[tokio::test]
    async fn spooler_failure_degrades_to_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("test.db")).unwrap(),
        ));
        let reconciler = Reconciler::new(
            Arc::new(MockSpooler { jobs: Vec::new(), fail_listing: true }),
            db,
        );

        assert!(reconciler.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn single_job_lookup() {
        let (_dir, _db, reconciler) = setup(vec![spool_job(30, "erin", 0)]);

        let job = reconciler.job(30).await.unwrap();
        assert_eq!(job.job.id, 30);

        let missing = reconciler.job(999).await;
        assert!(matches!(missing, Err(ServerError::JobNotFound(999))));
    }
}
