//! Request-scoped staging of input documents on disk.
//!
//! Every request gets its own [`tempfile::TempDir`]; decoded documents are
//! written inside it and registered as [`TempResource`]s. [`StagingArea::cleanup`]
//! deletes every resource and then the directory, and reports what it did.
//! Dropping a `StagingArea` without calling `cleanup` still removes the
//! directory.

use super::request::InputDocument;
use crate::error::ExtractError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Extension assumed when the filename has none.
pub const DEFAULT_EXTENSION: &str = ".pdf";

/// One staged file owned by a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempResource {
    /// Caller-supplied document name.
    pub document: String,
    pub path: PathBuf,
    pub bytes: usize,
}

/// Outcome of [`StagingArea::cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub allocated: usize,
    pub deleted: usize,
    /// Deletion problems; logged, never fatal.
    pub warnings: Vec<String>,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.allocated == self.deleted
    }
}

/// The temp directory and staged files of one request.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
    resources: Vec<TempResource>,
}

impl StagingArea {
    /// Create a fresh directory under `root`, or the OS temp dir.
    pub fn create(root: Option<&Path>) -> Result<Self, ExtractError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("docext-job-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|source| ExtractError::Io {
            path: root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir),
            source,
        })?;
        debug!("Staging directory {}", dir.path().display());
        Ok(Self {
            dir,
            resources: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn resources(&self) -> &[TempResource] {
        &self.resources
    }

    /// Decode `doc` and write it as `<index>-<stem><ext>`.
    pub async fn stage(
        &mut self,
        index: usize,
        doc: &InputDocument,
    ) -> Result<&TempResource, ExtractError> {
        let bytes = decode_payload(&doc.data).map_err(|e| ExtractError::Staging {
            document: doc.filename.clone(),
            detail: format!("invalid base64 data: {e}"),
        })?;

        let path = self.dir.path().join(staged_file_name(index, &doc.filename));
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ExtractError::Staging {
                document: doc.filename.clone(),
                detail: format!("cannot write {}: {e}", path.display()),
            })?;

        debug!("Staged {} ({} bytes) at {}", doc.filename, bytes.len(), path.display());
        self.resources.push(TempResource {
            document: doc.filename.clone(),
            path,
            bytes: bytes.len(),
        });
        Ok(&self.resources[self.resources.len() - 1])
    }

    /// Delete every registered resource and the directory.
    ///
    /// A resource that is already gone counts as deleted.
    pub fn cleanup(self) -> CleanupReport {
        let mut report = CleanupReport {
            allocated: self.resources.len(),
            ..Default::default()
        };

        for resource in &self.resources {
            match std::fs::remove_file(&resource.path) {
                Ok(()) => report.deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => report.deleted += 1,
                Err(e) => {
                    let msg = format!("cannot delete {}: {e}", resource.path.display());
                    warn!("{}", msg);
                    report.warnings.push(msg);
                }
            }
        }

        let dir_path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            let msg = format!("cannot remove {}: {e}", dir_path.display());
            warn!("{}", msg);
            report.warnings.push(msg);
        }
        report
    }
}

/// Drop everything up to and including a `base64,` data-URI marker.
pub fn strip_data_uri(data: &str) -> &str {
    match data.find("base64,") {
        Some(i) => &data[i + "base64,".len()..],
        None => data,
    }
}

/// Decode a standard base64 payload; embedded whitespace is ignored.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = strip_data_uri(data)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    STANDARD.decode(compact)
}

/// Extension of `filename` including the dot, or [`DEFAULT_EXTENSION`].
pub fn infer_extension(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_ascii_lowercase()))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// `<index>-<sanitised stem><ext>`; unique within a request by index.
pub fn staged_file_name(index: usize, filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = Path::new(&base)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut clean: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    if clean.is_empty() {
        clean.push_str("document");
    }
    format!("{index}-{clean}{}", infer_extension(&base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_data_uri_prefix() {
        assert_eq!(strip_data_uri("data:application/pdf;base64,JVBE"), "JVBE");
        assert_eq!(strip_data_uri("JVBE"), "JVBE");
    }

    #[test]
    fn decodes_with_whitespace() {
        assert_eq!(decode_payload("aGVs\nbG8=").unwrap(), b"hello");
        assert!(decode_payload("not base64!!").is_err());
    }

    #[test]
    fn extension_defaults_to_pdf() {
        assert_eq!(infer_extension("scan.PNG"), ".png");
        assert_eq!(infer_extension("invoice"), ".pdf");
    }

    #[test]
    fn staged_names_are_sanitised() {
        assert_eq!(staged_file_name(0, "../../etc/passwd"), "0-passwd.pdf");
        assert_eq!(staged_file_name(2, "my invoice.pdf"), "2-my_invoice.pdf");
        assert_eq!(staged_file_name(1, ""), "1-document.pdf");
    }

    #[tokio::test]
    async fn stage_and_cleanup_balance() {
        let root = tempfile::tempdir().unwrap();
        let mut area = StagingArea::create(Some(root.path())).unwrap();
        let dir = area.path().to_path_buf();

        let doc = InputDocument {
            filename: "a.txt".into(),
            data: "data:text/plain;base64,aGVsbG8=".into(),
        };
        let staged = area.stage(0, &doc).await.unwrap().clone();
        assert_eq!(staged.bytes, 5);
        assert_eq!(std::fs::read(&staged.path).unwrap(), b"hello");
        area.stage(1, &doc).await.unwrap();

        let report = area.cleanup();
        assert_eq!(report.allocated, 2);
        assert_eq!(report.deleted, 2);
        assert!(report.is_complete());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn bad_base64_names_the_document() {
        let mut area = StagingArea::create(None).unwrap();
        let doc = InputDocument {
            filename: "broken.pdf".into(),
            data: "%%%".into(),
        };
        let err = area.stage(0, &doc).await.unwrap_err();
        assert!(err.to_string().contains("broken.pdf"));
        assert_eq!(area.resources().len(), 0);
        assert!(area.cleanup().is_complete());
    }
}
