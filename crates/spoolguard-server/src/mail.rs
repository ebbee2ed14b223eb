//! Email-print ingress.
//!
//! A background poller pulls unseen messages from a mailbox, prints their
//! attachments as held jobs, and records the submission in the ledger so the
//! sender (resolved through the email-mapping table) owns the job.  Message
//! transport is an external collaborator behind [`MailTransport`]; the loop
//! only sees "fetch unseen, mark seen, optionally reply".
//!
//! One bad message never stops the loop: each message is processed in
//! isolation and failures are logged and skipped.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use spoolguard_store::{Database, SubmitChannel};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{MailConfig, ServerConfig};
use crate::convert::{sanitize_filename, validate_upload, Converter};
use crate::error::ServerError;
use crate::spooler::{PrintOptions, Spooler};

/// How long shutdown waits for an in-flight poll before proceeding.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// One inbound message with its printable payload.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Mailbox-assigned identifier, used to mark the message seen.
    pub uid: u32,
    pub sender: String,
    pub subject: String,
    /// `(filename, content)` pairs.
    pub attachments: Vec<(String, Vec<u8>)>,
}

/// Mailbox access boundary.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Messages not yet processed, oldest first.
    async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, ServerError>;

    /// Mark a message processed so it is not fetched again.
    async fn mark_seen(&self, uid: u32) -> Result<(), ServerError>;

    /// Send a confirmation or rejection reply.  Implementations without an
    /// outbound path may make this a no-op.
    async fn send_reply(&self, to: &str, subject: &str, body: &str) -> Result<(), ServerError>;
}

/// Transport over a local drop directory.
///
/// An external fetcher (fetchmail, getmail, a procmail rule) extracts
/// attachments and delivers them as `<sender>__<filename>` files into the
/// drop directory.  Each file is one single-attachment message; marking it
/// seen moves it into a `seen/` subdirectory.  There is no outbound path,
/// so replies are logged rather than sent.
pub struct DropDirTransport {
    dir: PathBuf,
    next_uid: std::sync::atomic::AtomicU32,
    pending: Mutex<std::collections::HashMap<u32, PathBuf>>,
}

impl DropDirTransport {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            next_uid: std::sync::atomic::AtomicU32::new(1),
            pending: Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl MailTransport for DropDirTransport {
    async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, ServerError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ServerError::Internal(format!("mail drop dir unavailable: {e}")))?;

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| ServerError::Internal(format!("failed to scan mail drop dir: {e}")))?;

        let mut messages = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ServerError::Internal(format!("failed to scan mail drop dir: {e}")))?
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let (sender, filename) = match name.split_once("__") {
                Some((sender, filename)) if sender.contains('@') && !filename.is_empty() => {
                    (sender.to_string(), filename.to_string())
                }
                _ => {
                    tracing::warn!(file = %name, "dropped file without sender prefix, ignoring");
                    continue;
                }
            };

            let content = tokio::fs::read(&path)
                .await
                .map_err(|e| ServerError::Internal(format!("failed to read {name}: {e}")))?;

            let uid = self
                .next_uid
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.pending
                .lock()
                .expect("pending map mutex poisoned")
                .insert(uid, path);

            messages.push(InboundMessage {
                uid,
                sender,
                subject: filename.clone(),
                attachments: vec![(filename, content)],
            });
        }

        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    async fn mark_seen(&self, uid: u32) -> Result<(), ServerError> {
        let path = self
            .pending
            .lock()
            .expect("pending map mutex poisoned")
            .remove(&uid)
            .ok_or_else(|| ServerError::Internal(format!("unknown mail uid {uid}")))?;

        let seen_dir = self.dir.join("seen");
        tokio::fs::create_dir_all(&seen_dir)
            .await
            .map_err(|e| ServerError::Internal(format!("failed to create seen dir: {e}")))?;

        let target = seen_dir.join(path.file_name().unwrap_or_default());
        tokio::fs::rename(&path, &target)
            .await
            .map_err(|e| ServerError::Internal(format!("failed to archive message: {e}")))?;
        Ok(())
    }

    async fn send_reply(&self, to: &str, subject: &str, body: &str) -> Result<(), ServerError> {
        // No outbound binding; the reply is recorded in the log instead.
        tracing::info!(%to, %subject, %body, "mail reply (not sent, no outbound transport)");
        Ok(())
    }
}

/// The background mailbox poller.
pub struct MailPrinter {
    transport: Arc<dyn MailTransport>,
    spooler: Arc<dyn Spooler>,
    converter: Arc<dyn Converter>,
    db: Arc<Mutex<Database>>,
    printer_name: String,
    upload_dir: PathBuf,
    max_upload_bytes: usize,
    poll_interval: Duration,
}

/// Handle for stopping the poller.
pub struct MailPrinterHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MailPrinterHandle {
    /// Signal the poll loop to stop and wait (bounded) for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.task).await.is_err() {
            tracing::warn!("mail poller did not stop in time, proceeding with shutdown");
        }
    }
}

impl MailPrinter {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        spooler: Arc<dyn Spooler>,
        converter: Arc<dyn Converter>,
        db: Arc<Mutex<Database>>,
        config: &ServerConfig,
        mail: &MailConfig,
    ) -> Self {
        Self {
            transport,
            spooler,
            converter,
            db,
            printer_name: config.printer_name.clone(),
            upload_dir: config.upload_dir.clone(),
            max_upload_bytes: config.max_upload_bytes,
            poll_interval: Duration::from_secs(mail.poll_interval_secs),
        }
    }

    /// Start the poll loop on the runtime.
    pub fn spawn(self) -> MailPrinterHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            tracing::info!(interval = ?self.poll_interval, "mail poller started");
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.poll_once().await,
                    _ = stopped.changed() => {
                        tracing::info!("mail poller stopping");
                        return;
                    }
                }
            }
        });
        MailPrinterHandle { stop, task }
    }

    /// One mailbox scan.  Transport failures end the scan; per-message
    /// failures end only that message.
    async fn poll_once(&self) {
        let messages = match self.transport.fetch_unseen().await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, "mailbox fetch failed, will retry");
                return;
            }
        };

        for message in messages {
            let uid = message.uid;
            let sender = message.sender.clone();

            match self.process_message(message).await {
                Ok(submitted) => {
                    tracing::info!(uid, sender = %sender, jobs = submitted, "mail message printed");
                    let body = format!(
                        "Your {submitted} document(s) have been queued and are held \
                         until released at the printer."
                    );
                    if let Err(e) = self.transport.send_reply(&sender, "Print job received", &body).await {
                        tracing::warn!(uid, error = %e, "confirmation reply failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(uid, sender = %sender, error = %e, "mail message failed, skipping");
                    let _ = self
                        .transport
                        .send_reply(&sender, "Print job rejected", &format!("Not printed: {e}"))
                        .await;
                }
            }

            // Seen either way; a poison message must not be refetched forever.
            if let Err(e) = self.transport.mark_seen(uid).await {
                tracing::warn!(uid, error = %e, "failed to mark message seen");
            }
        }
    }

    /// Print every valid attachment of one message.  Returns the number of
    /// jobs submitted; a message with no printable attachment is an error.
    async fn process_message(&self, message: InboundMessage) -> Result<usize, ServerError> {
        if message.attachments.is_empty() {
            return Err(ServerError::Validation("no attachments".into()));
        }

        // Sender identity is resolved once per message through the mapping
        // table; unmapped senders keep the raw address as submitter.
        let submitter = {
            let db = self.db.lock().expect("store mutex poisoned");
            db.email_mapping(&message.sender)?
                .unwrap_or_else(|| message.sender.to_lowercase())
        };

        tokio::fs::create_dir_all(&self.upload_dir)
            .await
            .map_err(|e| ServerError::Internal(format!("upload dir unavailable: {e}")))?;

        let mut submitted = 0usize;
        for (filename, content) in message.attachments {
            validate_upload(&filename, content.len(), self.max_upload_bytes)?;

            let safe_name = sanitize_filename(&filename);
            let staged = self.upload_dir.join(format!("{}_{safe_name}", Uuid::new_v4()));
            tokio::fs::write(&staged, &content)
                .await
                .map_err(|e| ServerError::Internal(format!("failed to stage attachment: {e}")))?;

            let printable = self.converter.convert(&staged).await;
            let job_id = self
                .spooler
                .submit(&self.printer_name, &printable, &safe_name, &PrintOptions::default())
                .await?;

            {
                let db = self.db.lock().expect("store mutex poisoned");
                db.record_submission(
                    job_id,
                    SubmitChannel::Email,
                    Some(&safe_name),
                    Some(&submitter),
                )?;
            }

            tracing::info!(job_id, file = %safe_name, submitter = %submitter, "email attachment queued");
            submitted += 1;
        }

        Ok(submitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, Ordering};

    use crate::spooler::{PrinterStatus, SpoolJob};

    struct MockTransport {
        messages: Mutex<Vec<InboundMessage>>,
        seen: Mutex<Vec<u32>>,
        replies: Mutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        fn with(messages: Vec<InboundMessage>) -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(messages),
                seen: Mutex::new(Vec::new()),
                replies: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl MailTransport for MockTransport {
        async fn fetch_unseen(&self) -> Result<Vec<InboundMessage>, ServerError> {
            Ok(std::mem::take(&mut *self.messages.lock().unwrap()))
        }

        async fn mark_seen(&self, uid: u32) -> Result<(), ServerError> {
            self.seen.lock().unwrap().push(uid);
            Ok(())
        }

        async fn send_reply(&self, to: &str, subject: &str, _body: &str) -> Result<(), ServerError> {
            self.replies.lock().unwrap().push((to.to_string(), subject.to_string()));
            Ok(())
        }
    }

    struct MockSpooler {
        next_id: AtomicI64,
    }

    #[async_trait]
    impl Spooler for MockSpooler {
        async fn submit(
            &self,
            _printer: &str,
            _path: &Path,
            _title: &str,
            _options: &PrintOptions,
        ) -> Result<i64, ServerError> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn jobs(&self) -> Result<HashMap<i64, SpoolJob>, ServerError> {
            Ok(HashMap::new())
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

    struct PassThrough;

    #[async_trait]
    impl Converter for PassThrough {
        async fn convert(&self, path: &Path) -> PathBuf {
            path.to_path_buf()
        }
    }

    fn message(uid: u32, sender: &str, attachments: Vec<(&str, &[u8])>) -> InboundMessage {
        InboundMessage {
            uid,
            sender: sender.to_string(),
            subject: "print this".to_string(),
            attachments: attachments
                .into_iter()
                .map(|(n, c)| (n.to_string(), c.to_vec()))
                .collect(),
        }
    }

    fn printer(
        dir: &tempfile::TempDir,
        transport: Arc<MockTransport>,
        db: Arc<Mutex<Database>>,
    ) -> MailPrinter {
        let config = ServerConfig {
            upload_dir: dir.path().join("uploads"),
            ..ServerConfig::default()
        };
        let mail = MailConfig {
            drop_dir: dir.path().join("maildrop"),
            poll_interval_secs: 30,
        };
        MailPrinter::new(
            transport,
            Arc::new(MockSpooler { next_id: AtomicI64::new(100) }),
            Arc::new(PassThrough),
            db,
            &config,
            &mail,
        )
    }

    fn open_db(dir: &tempfile::TempDir) -> Arc<Mutex<Database>> {
        Arc::new(Mutex::new(
            Database::open_at(&dir.path().join("test.db")).unwrap(),
        ))
    }

    #[tokio::test]
    async fn attachment_becomes_owned_email_job() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        db.lock()
            .unwrap()
            .upsert_email_mapping("alice@example.com", "alice")
            .unwrap();

        let transport = MockTransport::with(vec![message(
            1,
            "alice@example.com",
            vec![("report.pdf", b"%PDF-1.4")],
        )]);

        printer(&dir, transport.clone(), db.clone()).poll_once().await;

        let meta = db.lock().unwrap().get_job_meta(100).unwrap().unwrap();
        assert_eq!(meta.submitted_via, SubmitChannel::Email);
        assert_eq!(meta.submitted_by.as_deref(), Some("alice"));
        assert_eq!(meta.original_filename.as_deref(), Some("report.pdf"));

        assert_eq!(*transport.seen.lock().unwrap(), vec![1]);
        let replies = transport.replies.lock().unwrap();
        assert_eq!(replies[0].1, "Print job received");
    }

    #[tokio::test]
    async fn unmapped_sender_keeps_address_as_submitter() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        let transport = MockTransport::with(vec![message(
            2,
            "Visitor@Example.COM",
            vec![("scan.pdf", b"%PDF-1.4")],
        )]);

        printer(&dir, transport, db.clone()).poll_once().await;

        let meta = db.lock().unwrap().get_job_meta(100).unwrap().unwrap();
        assert_eq!(meta.submitted_by.as_deref(), Some("visitor@example.com"));
    }

    #[tokio::test]
    async fn bad_message_is_rejected_but_marked_seen() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);

        let transport = MockTransport::with(vec![
            message(3, "eve@example.com", vec![("virus.exe", b"MZ")]),
            message(4, "bob@example.com", vec![("ok.pdf", b"%PDF-1.4")]),
        ]);

        printer(&dir, transport.clone(), db.clone()).poll_once().await;

        // Both marked seen, only the valid one printed.
        assert_eq!(*transport.seen.lock().unwrap(), vec![3, 4]);
        assert!(db.lock().unwrap().get_job_meta(100).unwrap().is_some());

        let replies = transport.replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0], ("eve@example.com".to_string(), "Print job rejected".to_string()));
    }

    #[tokio::test]
    async fn empty_message_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let transport = MockTransport::with(vec![message(5, "bob@example.com", vec![])]);

        printer(&dir, transport.clone(), db).poll_once().await;

        let replies = transport.replies.lock().unwrap();
        assert_eq!(replies[0].1, "Print job rejected");
    }

    #[tokio::test]
    async fn drop_dir_transport_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let drop = dir.path().join("maildrop");
        tokio::fs::create_dir_all(&drop).await.unwrap();
        tokio::fs::write(drop.join("alice@example.com__report.pdf"), b"%PDF-1.4")
            .await
            .unwrap();
        // No sender prefix: ignored, not an error.
        tokio::fs::write(drop.join("stray.pdf"), b"x").await.unwrap();

        let transport = DropDirTransport::new(drop.clone());
        let messages = transport.fetch_unseen().await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "alice@example.com");
        assert_eq!(messages[0].attachments[0].0, "report.pdf");

        transport.mark_seen(messages[0].uid).await.unwrap();
        assert!(drop.join("seen").join("alice@example.com__report.pdf").exists());
        assert!(transport.fetch_unseen().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn handle_stops_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let transport = MockTransport::with(Vec::new());

        let handle = printer(&dir, transport, db).spawn();
        handle.shutdown().await;
    }
}
