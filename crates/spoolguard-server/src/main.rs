//! # spoolguard-server
//!
//! Hold-and-release manager for a shared CUPS print queue.
//!
//! This binary provides:
//! - **Held submission** on every ingress (web upload, token API, email):
//!   nothing prints until its owner releases it at the queue
//! - **Ownership reconciliation** merging the live spooler queue with the
//!   metadata ledger, device mappings, and recorded claims
//! - **REST API** (axum) for browsers, scripts, and kiosk displays, with
//!   per-credential rate limiting
//! - **Background ingest** polling a mailbox for print-by-email
//! - **Expiry sweep** clearing metadata for unclaimed jobs past their window

mod access;
mod api;
mod config;
mod convert;
mod error;
mod identity;
mod mail;
mod reconcile;
mod routes;
mod session;
mod spooler;

use std::sync::{Arc, Mutex};

use tracing::info;
use tracing_subscriber::EnvFilter;

use spoolguard_store::Database;

use crate::access::AccessGate;
use crate::api::AppState;
use crate::config::ServerConfig;
use crate::convert::LibreOffice;
use crate::identity::OidcProvider;
use crate::mail::MailPrinter;
use crate::reconcile::Reconciler;
use crate::session::SessionStore;
use crate::spooler::CupsCli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,spoolguard_server=debug")),
        )
        .init();

    info!("Starting spoolguard v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        printer = %config.printer_name,
        database = %config.database_path.display(),
        rate_limit = config.api_rate_limit,
        sso_enabled = config.oidc.is_some(),
        mail_enabled = config.mail.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Metadata ledger (creates parent directories and runs migrations)
    let db = Arc::new(Mutex::new(Database::new(&config.database_path)?));

    // External collaborators
    let spooler: Arc<dyn spooler::Spooler> = Arc::new(CupsCli);
    let converter: Arc<dyn convert::Converter> = Arc::new(LibreOffice);
    let identity = config
        .oidc
        .clone()
        .map(|oidc| Arc::new(OidcProvider::new(oidc)) as Arc<dyn identity::IdentityProvider>);

    let reconciler = Arc::new(Reconciler::new(spooler.clone(), db.clone()));

    let config = Arc::new(config);
    let app_state = AppState {
        db: db.clone(),
        spooler: spooler.clone(),
        converter: converter.clone(),
        reconciler,
        sessions: SessionStore::new(),
        gate: AccessGate::new(&config),
        identity,
        config: config.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Hourly sweep of unclaimed-job metadata past the configured window
    let sweep_db = db.clone();
    let sweep_hours = config.unclaimed_timeout_hours;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let swept = {
                let db = sweep_db.lock().expect("store mutex poisoned");
                db.cleanup_expired_unclaimed(sweep_hours)
            };
            match swept {
                Ok(ids) if !ids.is_empty() => {
                    info!(count = ids.len(), ?ids, "swept expired unclaimed job metadata");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
            }
        }
    });

    // Drop-directory mail poller, when configured
    let mail_handle = config.mail.as_ref().map(|mail| {
        MailPrinter::new(
            Arc::new(mail::DropDirTransport::new(mail.drop_dir.clone())),
            spooler.clone(),
            converter.clone(),
            db.clone(),
            &config,
            mail,
        )
        .spawn()
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    if let Some(handle) = mail_handle {
        handle.shutdown().await;
    }

    Ok(())
}
