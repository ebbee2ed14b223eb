//! Fixed-window request accounting for API credentials.
//!
//! Quota is bucketed by wall-clock minute, not a rolling interval: a burst
//! straddling a minute boundary can admit up to twice the limit in a short
//! span.  Callers must treat the limit as an approximate ceiling.
//!
//! Old window rows are garbage-collected lazily during the next check; there
//! is no background sweep.

use chrono::{DateTime, Duration, Timelike, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::keys::hash_secret;

impl Database {
    /// Check and consume one request slot for the credential.
    ///
    /// Returns `(allowed, remaining)`.  The whole check-and-increment runs in
    /// one transaction so two concurrent requests cannot both take the last
    /// slot.
    pub fn check_rate_limit(&self, raw_secret: &str, limit: i64) -> Result<(bool, i64)> {
        self.check_rate_limit_at(raw_secret, limit, Utc::now())
    }

    /// Like [`check_rate_limit`](Self::check_rate_limit) with an explicit
    /// clock, for tests exercising window boundaries.
    pub fn check_rate_limit_at(
        &self,
        raw_secret: &str,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<(bool, i64)> {
        let key_hash = hash_secret(raw_secret);
        let window_start = truncate_to_minute(now);

        let tx = self.conn().unchecked_transaction()?;

        // Lazy GC: anything older than the previous window is dead weight.
        tx.execute(
            "DELETE FROM rate_windows WHERE window_start < ?1",
            params![(window_start - Duration::minutes(1)).to_rfc3339()],
        )?;

        let count: Option<i64> = tx
            .query_row(
                "SELECT request_count FROM rate_windows
                 WHERE key_hash = ?1 AND window_start = ?2",
                params![key_hash, window_start.to_rfc3339()],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match count {
            Some(count) if count >= limit => {
                let prefix: String = raw_secret.chars().take(10).collect();
                tracing::warn!(%prefix, "rate limit exceeded");
                (false, 0)
            }
            Some(count) => {
                tx.execute(
                    "UPDATE rate_windows SET request_count = request_count + 1
                     WHERE key_hash = ?1 AND window_start = ?2",
                    params![key_hash, window_start.to_rfc3339()],
                )?;
                (true, limit - count - 1)
            }
            None => {
                tx.execute(
                    "INSERT INTO rate_windows (key_hash, window_start, request_count)
                     VALUES (?1, ?2, 1)",
                    params![key_hash, window_start.to_rfc3339()],
                )?;
                (true, limit - 1)
            }
        };

        tx.commit()?;
        Ok(outcome)
    }
}

/// Truncate a timestamp to the start of its wall-clock minute.
fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("zeroing sub-minute fields cannot overflow")
}
