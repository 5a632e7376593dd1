//! Hash-addressed archive of fetched source pages for offline re-extraction.

use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    /// The same bytes were already archived for this host and day.
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "text/html" | "application/xhtml+xml" => "html",
        "application/json" => "json",
        "application/pdf" => "pdf",
        "text/calendar" => "ics",
        "text/plain" => "txt",
        _ => "bin",
    }
}

fn host_dir(host: &str) -> String {
    let safe = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect::<String>();
    if safe.is_empty() {
        "unknown".to_string()
    } else {
        safe
    }
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store `bytes` at `<yyyymmdd>/<host>/<sha256>.<ext>`. The file appears
    /// whole or not at all; writers racing on identical bytes converge on it.
    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        host: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = hex::encode(Sha256::digest(bytes));
        let dir = PathBuf::from(fetched_at.format("%Y%m%d").to_string()).join(host_dir(host));
        let relative_path = dir.join(format!("{content_hash}.{}", extension_for(content_type)));
        let target = self.root.join(&relative_path);

        let exists = fs::try_exists(&target)
            .await
            .with_context(|| format!("checking {}", target.display()))?;
        if !exists {
            let dir = self.root.join(&dir);
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
            let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
            fs::write(&partial, bytes)
                .await
                .with_context(|| format!("writing {}", partial.display()))?;
            if let Err(err) = fs::rename(&partial, &target).await {
                let _ = fs::remove_file(&partial).await;
                return Err(err).with_context(|| format!("moving page into {}", target.display()));
            }
        }

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            deduplicated: exists,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn extension_follows_content_type() {
        assert_eq!(extension_for(Some("text/html; charset=UTF-8")), "html");
        assert_eq!(extension_for(Some("application/pdf")), "pdf");
        assert_eq!(extension_for(None), "bin");
        assert_eq!(host_dir("a b:8080"), "a_b_8080");
    }

    #[tokio::test]
    async fn identical_pages_archive_once() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-11-02T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let first = store
            .archive_page(fetched_at, "wasoccer.org", Some("text/html"), b"hello world")
            .await
            .unwrap();
        let second = store
            .archive_page(fetched_at, "wasoccer.org", Some("text/html"), b"hello world")
            .await
            .unwrap();

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(
            first.content_hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            first.relative_path,
            PathBuf::from("20251102/wasoccer.org").join(format!("{}.html", first.content_hash))
        );
        let stored = std::fs::read(dir.path().join(&first.relative_path)).unwrap();
        assert_eq!(stored, b"hello world");
    }
}
