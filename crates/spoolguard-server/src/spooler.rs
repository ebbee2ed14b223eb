//! External print spooler boundary.
//!
//! The spooler (CUPS) fully owns job lifecycle; this service only submits,
//! lists, releases, and cancels through it.  Everything is expressed against
//! the [`Spooler`] trait so the reconciler and routes never touch the CUPS
//! binding directly, and tests can substitute a mock.
//!
//! The shipped implementation, [`CupsCli`], shells out to the classic CUPS
//! command-line tools (`lp`, `lpstat`, `cancel`) with short fixed timeouts.
//! Their output is recovered through the small grammar in [`parse`] rather
//! than free-text matching.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;

use crate::error::ServerError;

/// IPP job states as reported by the spooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Pending,
    Held,
    Processing,
    Stopped,
    Canceled,
    Aborted,
    Completed,
    Unknown,
}

impl JobState {
    /// Map the IPP `job-state` integer (3..=9).
    pub fn from_ipp(code: i64) -> Self {
        match code {
            3 => JobState::Pending,
            4 => JobState::Held,
            5 => JobState::Processing,
            6 => JobState::Stopped,
            7 => JobState::Canceled,
            8 => JobState::Aborted,
            9 => JobState::Completed,
            _ => JobState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Held => "Held",
            JobState::Processing => "Processing",
            JobState::Stopped => "Stopped",
            JobState::Canceled => "Canceled",
            JobState::Aborted => "Aborted",
            JobState::Completed => "Completed",
            JobState::Unknown => "Unknown",
        }
    }
}

/// Printer states as reported by the spooler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrinterState {
    Idle,
    Processing,
    Stopped,
    Unknown,
}

impl PrinterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterState::Idle => "Idle",
            PrinterState::Processing => "Processing",
            PrinterState::Stopped => "Stopped",
            PrinterState::Unknown => "Unknown",
        }
    }
}

/// A live job as seen in the spooler queue.  All fields are low-trust
/// (notably `originating_user`); missing attributes get the documented
/// defaults rather than failing the listing.
#[derive(Debug, Clone, Serialize)]
pub struct SpoolJob {
    pub id: i64,
    pub title: String,
    pub originating_user: String,
    pub printer: String,
    pub state: JobState,
    pub pages: i64,
    pub size_kb: i64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Printer status summary.
#[derive(Debug, Clone, Serialize)]
pub struct PrinterStatus {
    pub name: String,
    pub state: PrinterState,
    pub state_message: String,
    pub accepting: bool,
}

/// Print options accepted at submission.
#[derive(Debug, Clone, Default)]
pub struct PrintOptions {
    pub copies: Option<u32>,
    pub duplex: bool,
    pub grayscale: bool,
    pub page_ranges: Option<String>,
}

/// The external spooler contract.  All submissions are created held; no job
/// prints without an explicit release.
#[async_trait]
pub trait Spooler: Send + Sync {
    /// Submit a file as a held job, returning the spooler-assigned job id.
    async fn submit(
        &self,
        printer: &str,
        path: &Path,
        title: &str,
        options: &PrintOptions,
    ) -> Result<i64, ServerError>;

    /// Live not-completed jobs, keyed by job id.
    async fn jobs(&self) -> Result<HashMap<i64, SpoolJob>, ServerError>;

    /// Release a held job for printing.
    async fn release(&self, job_id: i64) -> Result<(), ServerError>;

    /// Cancel a job.
    async fn cancel(&self, job_id: i64) -> Result<(), ServerError>;

    /// All printers known to the spooler.
    async fn printers(&self) -> Result<Vec<PrinterStatus>, ServerError>;
}

// ---------------------------------------------------------------------------
// CUPS CLI implementation
// ---------------------------------------------------------------------------

/// Timeout for spooler introspection and control commands.
const SPOOLER_TIMEOUT: Duration = Duration::from_secs(5);

/// Spooler backed by the CUPS command-line tools.
pub struct CupsCli;

impl CupsCli {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, ServerError> {
        let output = tokio::time::timeout(
            SPOOLER_TIMEOUT,
            Command::new(program).args(args).output(),
        )
        .await
        .map_err(|_| ServerError::Upstream(format!("{program} timed out")))?
        .map_err(|e| ServerError::Upstream(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServerError::Upstream(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Spooler for CupsCli {
    async fn submit(
        &self,
        printer: &str,
        path: &Path,
        title: &str,
        options: &PrintOptions,
    ) -> Result<i64, ServerError> {
        let mut args: Vec<String> = vec![
            "-d".into(),
            printer.into(),
            "-t".into(),
            title.into(),
            // Core safety property: every submission is held until released.
            "-H".into(),
            "indefinite".into(),
        ];

        if let Some(copies) = options.copies {
            args.push("-n".into());
            args.push(copies.to_string());
        }
        if options.duplex {
            args.push("-o".into());
            args.push("sides=two-sided-long-edge".into());
        }
        if options.grayscale {
            args.push("-o".into());
            args.push("ColorModel=Gray".into());
        }
        if let Some(ranges) = &options.page_ranges {
            args.push("-o".into());
            args.push(format!("page-ranges={ranges}"));
        }
        args.push(path.display().to_string());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self.run("lp", &arg_refs).await?;

        parse::submit_reply(&stdout).ok_or_else(|| {
            ServerError::Upstream(format!("unrecognized lp reply: {}", stdout.trim()))
        })
    }

    async fn jobs(&self) -> Result<HashMap<i64, SpoolJob>, ServerError> {
        let stdout = self.run("lpstat", &["-W", "not-completed", "-o", "-l"]).await?;
        Ok(parse::job_listing(&stdout))
    }

    async fn release(&self, job_id: i64) -> Result<(), ServerError> {
        self.run("lp", &["-i", &job_id.to_string(), "-H", "resume"])
            .await?;
        Ok(())
    }

    async fn cancel(&self, job_id: i64) -> Result<(), ServerError> {
        self.run("cancel", &[&job_id.to_string()]).await?;
        Ok(())
    }

    async fn printers(&self) -> Result<Vec<PrinterStatus>, ServerError> {
        let states = self.run("lpstat", &["-p"]).await?;
        let accepting = self.run("lpstat", &["-a"]).await?;
        Ok(parse::printer_listing(&states, &accepting))
    }
}

// ---------------------------------------------------------------------------
// Output grammar
// ---------------------------------------------------------------------------

/// Minimal, testable grammar for the two CUPS CLI output formats this
/// service depends on.  Anything that does not match is skipped with a
/// warning; parsing never panics and never guesses beyond the grammar.
pub mod parse {
    use super::*;

    /// `request id is <printer>-<id> (n file(s))` -> job id.
    pub fn submit_reply(stdout: &str) -> Option<i64> {
        let line = stdout.lines().find(|l| l.contains("request id is"))?;
        let after = line.split("request id is").nth(1)?.trim();
        let request_id = after.split_whitespace().next()?;
        job_id_from_request(request_id)
    }

    /// `<printer>-<id>` -> id.  The printer name may itself contain dashes,
    /// so the id is everything after the last dash.
    pub fn job_id_from_request(request_id: &str) -> Option<i64> {
        let (_, id) = request_id.rsplit_once('-')?;
        id.parse().ok()
    }

    /// Parse `lpstat -W not-completed -o -l` output.
    ///
    /// Each job starts with a header line:
    /// `<printer>-<id>  <user>  <size-bytes>  <date...>`
    /// optionally followed by indented attribute lines such as
    /// `        Status: job is held` or `        queued for <printer>`.
    pub fn job_listing(stdout: &str) -> HashMap<i64, SpoolJob> {
        let mut jobs = HashMap::new();
        let mut current: Option<i64> = None;

        for line in stdout.lines() {
            if line.is_empty() {
                continue;
            }

            if line.starts_with(char::is_whitespace) {
                // Attribute continuation for the current job.
                if let Some(id) = current {
                    if let Some(job) = jobs.get_mut(&id) {
                        apply_attribute(job, line.trim());
                    }
                }
                continue;
            }

            match job_header(line) {
                Some(job) => {
                    current = Some(job.id);
                    jobs.insert(job.id, job);
                }
                None => {
                    current = None;
                    tracing::warn!(line, "unparseable lpstat job line, skipping");
                }
            }
        }

        jobs
    }

    /// Parse one job header line.
    fn job_header(line: &str) -> Option<SpoolJob> {
        let mut fields = line.split_whitespace();
        let request_id = fields.next()?;
        let id = job_id_from_request(request_id)?;
        let (printer, _) = request_id.rsplit_once('-')?;

        // Partial attribute data still yields a job with defaults.
        let user = fields.next().unwrap_or("Unknown").to_string();
        let size_bytes: i64 = fields.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        let rest: Vec<&str> = fields.collect();
        let created_at = parse_lpstat_date(&rest.join(" "));

        Some(SpoolJob {
            id,
            title: "Untitled".to_string(),
            originating_user: user,
            printer: printer.to_string(),
            state: JobState::Unknown,
            pages: 0,
            size_kb: size_bytes / 1024,
            created_at,
        })
    }

    /// Fold an indented attribute line into the job.
    fn apply_attribute(job: &mut SpoolJob, attr: &str) {
        if let Some(status) = attr.strip_prefix("Status:") {
            let status = status.trim();
            job.state = if status.contains("held") {
                JobState::Held
            } else if status.contains("processing") || status.contains("printing") {
                JobState::Processing
            } else if status.contains("stopped") {
                JobState::Stopped
            } else {
                JobState::Pending
            };
        } else if let Some(name) = attr.strip_prefix("job-name=") {
            job.title = name.trim().to_string();
        } else if let Some(pages) = attr.strip_prefix("job-media-sheets-completed=") {
            job.pages = pages.trim().parse().unwrap_or(0);
        }
    }

    /// lpstat prints dates in the system locale; only the common
    /// `Mon 01 Jan 2025 10:30:00 AM UTC`-style and RFC-3339 forms are
    /// recognized.  Anything else is reported as unknown.
    fn parse_lpstat_date(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }

        for fmt in ["%a %d %b %Y %I:%M:%S %p %Z", "%a %b %e %H:%M:%S %Y"] {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, fmt) {
                return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
            }
        }

        None
    }

    /// Parse `lpstat -p` and `lpstat -a` output into printer statuses.
    pub fn printer_listing(states: &str, accepting: &str) -> Vec<PrinterStatus> {
        let accepting_set: std::collections::HashSet<&str> = accepting
            .lines()
            .filter(|l| l.contains("accepting requests"))
            .filter(|l| !l.contains("not accepting"))
            .filter_map(|l| l.split_whitespace().next())
            .collect();

        states
            .lines()
            .filter_map(|line| {
                let name = line.strip_prefix("printer ")?.split_whitespace().next()?;
                let state = if line.contains("is idle") {
                    PrinterState::Idle
                } else if line.contains("now printing") {
                    PrinterState::Processing
                } else if line.contains("disabled") {
                    PrinterState::Stopped
                } else {
                    PrinterState::Unknown
                };
                Some(PrinterStatus {
                    name: name.to_string(),
                    state,
                    state_message: line.trim().to_string(),
                    accepting: accepting_set.contains(name),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::parse::*;
    use super::*;

    #[test]
    fn submit_reply_extracts_job_id() {
        let out = "request id is HP_Smart_Tank_515-142 (1 file(s))\n";
        assert_eq!(submit_reply(out), Some(142));

        // Printer names with dashes take the trailing number.
        let out = "request id is front-desk-laser-7 (1 file(s))\n";
        assert_eq!(submit_reply(out), Some(7));

        assert_eq!(submit_reply("lp: error - no default destination\n"), None);
        assert_eq!(submit_reply(""), None);
    }

    #[test]
    fn job_listing_parses_headers_and_attributes() {
        let out = "\
HP_Smart_Tank_515-17   alice   20480   Mon 01 Jan 2025 10:30:00 AM UTC
        Status: job is held
        job-name=quarterly-report.pdf
HP_Smart_Tank_515-18   shared-pc   1024   Mon 01 Jan 2025 10:31:00 AM UTC
";
        let jobs = job_listing(out);
        assert_eq!(jobs.len(), 2);

        let j17 = &jobs[&17];
        assert_eq!(j17.originating_user, "alice");
        assert_eq!(j17.state, JobState::Held);
        assert_eq!(j17.title, "quarterly-report.pdf");
        assert_eq!(j17.size_kb, 20);
        assert!(j17.created_at.is_some());

        // No attribute lines: documented defaults.
        let j18 = &jobs[&18];
        assert_eq!(j18.title, "Untitled");
        assert_eq!(j18.state, JobState::Unknown);
        assert_eq!(j18.pages, 0);
    }

    #[test]
    fn job_listing_skips_garbage_lines() {
        let out = "\
no entries
HP_Smart_Tank_515-9   bob   512   Mon 01 Jan 2025 09:00:00 AM UTC
";
        let jobs = job_listing(out);
        assert_eq!(jobs.len(), 1);
        assert!(jobs.contains_key(&9));
    }

    #[test]
    fn job_header_with_missing_fields_gets_defaults() {
        let jobs = job_listing("HP_Smart_Tank_515-3\n");
        let job = &jobs[&3];
        assert_eq!(job.originating_user, "Unknown");
        assert_eq!(job.size_kb, 0);
        assert!(job.created_at.is_none());
    }

    #[test]
    fn printer_listing_merges_state_and_accepting() {
        let states = "\
printer HP_Smart_Tank_515 is idle.  enabled since Mon 01 Jan 2025
printer old-laser disabled since Mon 01 Jan 2024 -
";
        let accepting = "\
HP_Smart_Tank_515 accepting requests since Mon 01 Jan 2025
old-laser not accepting requests since Mon 01 Jan 2024 -
";
        let printers = printer_listing(states, accepting);
        assert_eq!(printers.len(), 2);

        let tank = printers.iter().find(|p| p.name == "HP_Smart_Tank_515").unwrap();
        assert_eq!(tank.state, PrinterState::Idle);
        assert!(tank.accepting);

        let laser = printers.iter().find(|p| p.name == "old-laser").unwrap();
        assert_eq!(laser.state, PrinterState::Stopped);
        assert!(!laser.accepting);
    }

    #[test]
    fn ipp_state_mapping() {
        assert_eq!(JobState::from_ipp(4), JobState::Held);
        assert_eq!(JobState::from_ipp(9), JobState::Completed);
        assert_eq!(JobState::from_ipp(0), JobState::Unknown);
        assert_eq!(JobState::from_ipp(42), JobState::Unknown);
    }
}
