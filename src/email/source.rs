//! Loading `.eml` files into `EmailMessage` records.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::EmailMessage;
use crate::error::SourceError;

/// Read and parse one `.eml` file. The file stem is the id fallback.
pub async fn load_eml_file(path: &Path) -> Result<EmailMessage, SourceError> {
    let raw = tokio::fs::read(path).await.map_err(|e| SourceError::Read {
        path: path.display().to_string(),
        source: e,
    })?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("message");

    let message = EmailMessage::from_raw(stem, raw).ok_or_else(|| SourceError::Unparseable {
        path: path.display().to_string(),
    })?;
    debug!(path = %path.display(), id = %message.id, "Loaded message");
    Ok(message)
}

/// Expand input arguments into a sorted list of `.eml` files.
///
/// Files are taken as given; directories contribute their `.eml` entries
/// (non-recursive).
pub async fn collect_eml_paths(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, SourceError> {
    let mut paths = Vec::new();
    for input in inputs {
        let meta = tokio::fs::metadata(input)
            .await
            .map_err(|e| SourceError::Read {
                path: input.display().to_string(),
                source: e,
            })?;
        if !meta.is_dir() {
            paths.push(input.clone());
            continue;
        }

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(input)
            .await
            .map_err(|e| SourceError::Read {
                path: input.display().to_string(),
                source: e,
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| SourceError::Read {
            path: input.display().to_string(),
            source: e,
        })? {
            let path = entry.path();
            let is_eml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("eml"));
            if is_eml {
                found.push(path);
            }
        }
        found.sort();
        paths.extend(found);
    }
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "Message-ID: <m1@example.com>\r\nFrom: a@example.com\r\nSubject: Hello\r\n\r\nBody\r\n";

    #[tokio::test]
    async fn loads_file_and_reads_headers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("first.eml");
        std::fs::write(&path, RAW).unwrap();

        let msg = load_eml_file(&path).await.unwrap();
        assert_eq!(msg.id, "m1@example.com");
        assert_eq!(msg.subject, "Hello");
    }

    #[tokio::test]
    async fn missing_file_is_read_error() {
        let err = load_eml_file(Path::new("/definitely/not/here.eml"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Read { .. }));
    }

    #[tokio::test]
    async fn directory_expands_to_sorted_eml_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.eml"), RAW).unwrap();
        std::fs::write(dir.path().join("a.eml"), RAW).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let paths = collect_eml_paths(&[dir.path().to_path_buf()]).await.unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.eml", "b.eml"]);
    }
}
