use std::io::ErrorKind;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("unsupported file format: {0:?}")]
    UnsupportedFormat(String),
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("source is not valid UTF-8 text: {0}")]
    NotText(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReadError {
    pub fn is_transient(&self) -> bool {
        match self {
            ReadError::Io { source, .. } => matches!(
                source.kind(),
                ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

/// Reads the raw text of a document from its `source_path`.
pub struct SourceReader;

impl SourceReader {
    pub async fn read_file(path: &Path) -> Result<String, ReadError> {
        let shown = path.display().to_string();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");

        match extension {
            "txt" | "md" => match fs::read_to_string(path).await {
                Ok(content) => {
                    debug!(path = %shown, bytes = content.len(), "Read source document");
                    Ok(content)
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Err(ReadError::NotFound(shown)),
                Err(e) if e.kind() == ErrorKind::InvalidData => Err(ReadError::NotText(shown)),
                Err(source) => Err(ReadError::Io {
                    path: shown,
                    source,
                }),
            },
            _ => Err(ReadError::UnsupportedFormat(extension.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_markdown_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Title\n\nBody").unwrap();

        let content = SourceReader::read_file(&path).await.unwrap();
        assert_eq!(content, "# Title\n\nBody");
    }

    #[tokio::test]
    async fn unsupported_and_missing_sources_are_permanent() {
        let dir = tempfile::tempdir().unwrap();

        let err = SourceReader::read_file(&dir.path().join("scan.pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::UnsupportedFormat(ref ext) if ext == "pdf"));
        assert!(!err.is_transient());

        let err = SourceReader::read_file(&dir.path().join("gone.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReadError::NotFound(_)));
        assert!(!err.is_transient());
    }
}
