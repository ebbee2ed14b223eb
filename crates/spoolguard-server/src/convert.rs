//! Upload validation and best-effort document conversion.
//!
//! Conversion is an external collaborator: the contract is
//! "`convert(file) -> printable_file`, returning the input unchanged on any
//! failure".  The shipped implementation drives LibreOffice headless.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ALLOWED_EXTENSIONS;
use crate::error::ServerError;

/// Extensions the spooler accepts without conversion.
const DIRECT_PRINT: &[&str] = &["pdf", "png", "jpg", "jpeg"];

/// How long a single conversion may take.
const CONVERT_TIMEOUT: Duration = Duration::from_secs(60);

/// Lowercased extension of a filename, if any.
pub fn extension(filename: &str) -> Option<String> {
    filename.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
}

/// Validate an upload's name and size against the accepted document types.
pub fn validate_upload(filename: &str, size: usize, max_bytes: usize) -> Result<(), ServerError> {
    let ext = extension(filename).unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ServerError::Validation(format!(
            "file type not allowed; accepted: {}",
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }

    if size == 0 {
        return Err(ServerError::Validation("file is empty".into()));
    }
    if size > max_bytes {
        return Err(ServerError::Validation(format!(
            "file too large ({size} bytes, max {max_bytes})"
        )));
    }

    Ok(())
}

/// Reduce a client-supplied filename to a safe basename: path components
/// stripped, anything outside `[A-Za-z0-9._-]` replaced.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Best-effort document conversion.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Return a printable version of `path`.  Never fails: on any problem
    /// the original path comes back and the spooler gets to try its luck.
    async fn convert(&self, path: &Path) -> PathBuf;
}

/// Converter backed by `libreoffice --headless`.
pub struct LibreOffice;

#[async_trait]
impl Converter for LibreOffice {
    async fn convert(&self, path: &Path) -> PathBuf {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default();

        if DIRECT_PRINT.contains(&ext.as_str()) {
            return path.to_path_buf();
        }

        let out_dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return path.to_path_buf(),
        };

        let result = tokio::time::timeout(
            CONVERT_TIMEOUT,
            Command::new("libreoffice")
                .arg("--headless")
                .arg("--convert-to")
                .arg("pdf")
                .arg("--outdir")
                .arg(&out_dir)
                .arg(path)
                .output(),
        )
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                let pdf = out_dir.join(
                    Path::new(path.file_stem().unwrap_or_default()).with_extension("pdf"),
                );
                if pdf.exists() {
                    pdf
                } else {
                    tracing::warn!(path = %path.display(), "conversion produced no output, printing original");
                    path.to_path_buf()
                }
            }
            Ok(Ok(output)) => {
                tracing::warn!(
                    path = %path.display(),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "conversion failed, printing original"
                );
                path.to_path_buf()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "libreoffice not runnable, printing original");
                path.to_path_buf()
            }
            Err(_) => {
                tracing::warn!(path = %path.display(), "conversion timed out, printing original");
                path.to_path_buf()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_extension_and_size() {
        assert!(validate_upload("report.pdf", 1024, 10_000).is_ok());
        assert!(validate_upload("notes.TXT", 1, 10_000).is_ok()); // case-folded

        assert!(matches!(
            validate_upload("malware.exe", 10, 10_000),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            validate_upload("noextension", 10, 10_000),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            validate_upload("big.pdf", 20_000, 10_000),
            Err(ServerError::Validation(_))
        ));
        assert!(matches!(
            validate_upload("empty.pdf", 0, 10_000),
            Err(ServerError::Validation(_))
        ));
    }

    #[test]
    fn sanitizes_hostile_filenames() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\x\\doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_filename("my résumé.pdf"), "my_r_sum_.pdf");
        assert_eq!(sanitize_filename("..."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
    }

    #[tokio::test]
    async fn direct_print_types_skip_conversion() {
        let converted = LibreOffice.convert(Path::new("/tmp/photo.JPG")).await;
        assert_eq!(converted, PathBuf::from("/tmp/photo.JPG"));
    }
}
