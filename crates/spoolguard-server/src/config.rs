//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.  The resulting value is immutable
//! and injected into each component at construction; business logic never
//! reads the environment directly.

use std::net::SocketAddr;
use std::path::PathBuf;

/// File extensions accepted for upload and email submission.
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "docx", "doc", "txt"];

/// OpenID Connect relying-party settings.  Absent when SSO is not
/// configured (sessions then cannot be established, but the token API
/// still works).
#[derive(Debug, Clone)]
pub struct OidcConfig {
    /// Env: `OIDC_CLIENT_ID`
    pub client_id: String,
    /// Env: `OIDC_CLIENT_SECRET`
    pub client_secret: String,
    /// Issuer base URL; discovery document lives at
    /// `<issuer>/.well-known/openid-configuration`.
    /// Env: `OIDC_ISSUER_URL`
    pub issuer_url: String,
    /// Absolute URL of this service's `/authorize` callback.
    /// Env: `OIDC_REDIRECT_URL`
    pub redirect_url: String,
}

/// Settings for the email-print ingress.
///
/// Mailbox retrieval is delegated to an external fetcher (fetchmail or
/// similar) delivering attachments into the drop directory; this service
/// only polls that directory.
#[derive(Debug, Clone)]
pub struct MailConfig {
    /// Directory the external fetcher delivers into.
    /// Env: `MAIL_DROP_DIR` (default `./data/maildrop`)
    pub drop_dir: PathBuf,
    /// Seconds between drop-directory scans.
    /// Env: `MAIL_POLL_INTERVAL` (default 30)
    pub poll_interval_secs: u64,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database path.
    /// Env: `DATABASE_PATH`
    /// Default: `./data/spoolguard.db`
    pub database_path: PathBuf,

    /// Directory where uploaded documents are staged before submission.
    /// Env: `UPLOAD_DIR`
    /// Default: `./data/uploads`
    pub upload_dir: PathBuf,

    /// Name of the default printer jobs are submitted to.
    /// Env: `PRINTER_NAME`
    /// Default: `HP_Smart_Tank_515`
    pub printer_name: String,

    /// Groups whose members are administrators.
    /// Env: `ADMIN_GROUPS` (comma-separated)
    /// Default: `admins,print-admins`
    pub admin_groups: Vec<String>,

    /// Usernames that are administrators regardless of groups.
    /// Env: `ADMIN_USERS` (comma-separated)
    /// Default: `admin`
    pub admin_users: Vec<String>,

    /// Requests per credential per minute.
    /// Env: `API_RATE_LIMIT`
    /// Default: `100`
    pub api_rate_limit: i64,

    /// Hours before unclaimed ipp job metadata is swept.
    /// Env: `UNCLAIMED_JOB_TIMEOUT`
    /// Default: `24`
    pub unclaimed_timeout_hours: i64,

    /// Maximum upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE` (MiB)
    /// Default: 50 MiB
    pub max_upload_bytes: usize,

    /// OIDC settings, when all four variables are present.
    pub oidc: Option<OidcConfig>,

    /// Mail ingress settings; `None` unless `MAIL_ENABLED=true`.
    pub mail: Option<MailConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            database_path: PathBuf::from("./data/spoolguard.db"),
            upload_dir: PathBuf::from("./data/uploads"),
            printer_name: "HP_Smart_Tank_515".to_string(),
            admin_groups: vec!["admins".to_string(), "print-admins".to_string()],
            admin_users: vec!["admin".to_string()],
            api_rate_limit: 100,
            unclaimed_timeout_hours: 24,
            max_upload_bytes: 50 * 1024 * 1024,
            oidc: None,
            mail: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(path);
        }

        if let Ok(name) = std::env::var("PRINTER_NAME") {
            config.printer_name = name;
        }

        if let Ok(groups) = std::env::var("ADMIN_GROUPS") {
            config.admin_groups = split_list(&groups);
        }

        if let Ok(users) = std::env::var("ADMIN_USERS") {
            config.admin_users = split_list(&users);
        }

        if let Ok(val) = std::env::var("API_RATE_LIMIT") {
            if let Ok(n) = val.parse::<i64>() {
                config.api_rate_limit = n;
            }
        }

        if let Ok(val) = std::env::var("UNCLAIMED_JOB_TIMEOUT") {
            if let Ok(n) = val.parse::<i64>() {
                config.unclaimed_timeout_hours = n;
            }
        }

        if let Ok(val) = std::env::var("MAX_UPLOAD_SIZE") {
            if let Ok(mib) = val.parse::<usize>() {
                config.max_upload_bytes = mib * 1024 * 1024;
            }
        }

        config.oidc = oidc_from_env();
        config.mail = mail_from_env();

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn oidc_from_env() -> Option<OidcConfig> {
    let client_id = std::env::var("OIDC_CLIENT_ID").ok()?;
    let client_secret = std::env::var("OIDC_CLIENT_SECRET").ok()?;
    let issuer_url = std::env::var("OIDC_ISSUER_URL").ok()?;
    let redirect_url = std::env::var("OIDC_REDIRECT_URL").ok()?;

    Some(OidcConfig {
        client_id,
        client_secret,
        issuer_url,
        redirect_url,
    })
}

fn mail_from_env() -> Option<MailConfig> {
    let enabled = std::env::var("MAIL_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if !enabled {
        return None;
    }

    Some(MailConfig {
        drop_dir: std::env::var("MAIL_DROP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/maildrop")),
        poll_interval_secs: env_parse("MAIL_POLL_INTERVAL", 30),
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
