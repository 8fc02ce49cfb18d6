//! Document loaders for `Collection::upsert`.
//!
//! A loader turns some external resource into [`RawContentItem`]s. Each
//! loader reports a [`DocumentLoader::source_label`], which becomes the
//! `source` metadata of every chunk it produces.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::extract::extract_pdf_blocking;
use crate::models::RawContentItem;

#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Provenance tag written into each chunk's `source` metadata.
    fn source_label(&self) -> String;

    async fn load(&self) -> Result<Vec<RawContentItem>>;
}

/// Reads one PDF file and extracts its text.
///
/// Any read or parse failure fails the whole load. The item's `url` metadata
/// is the path as given.
pub struct PdfLoader {
    path: PathBuf,
}

impl PdfLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DocumentLoader for PdfLoader {
    fn source_label(&self) -> String {
        "PdfLoader".to_string()
    }

    async fn load(&self) -> Result<Vec<RawContentItem>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read PDF: {}", self.path.display()))?;
        let text = extract_pdf_blocking(bytes)
            .await
            .with_context(|| format!("Failed to parse PDF: {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), chars = text.len(), "loaded pdf");
        Ok(vec![RawContentItem::new(text)
            .with_metadata("url", self.path.display().to_string())])
    }
}

/// Reads a UTF-8 text file as-is.
pub struct TextLoader {
    path: PathBuf,
}

impl TextLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DocumentLoader for TextLoader {
    fn source_label(&self) -> String {
        "TextLoader".to_string()
    }

    async fn load(&self) -> Result<Vec<RawContentItem>> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read file: {}", self.path.display()))?;
        Ok(vec![RawContentItem::new(text)
            .with_metadata("url", self.path.display().to_string())])
    }
}

/// Pick a loader by file extension: `.pdf` gets a [`PdfLoader`], anything
/// else a [`TextLoader`].
pub fn loader_for_path(path: impl Into<PathBuf>) -> Box<dyn DocumentLoader> {
    let path = path.into();
    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pdf"))
        .unwrap_or(false);
    if is_pdf {
        Box::new(PdfLoader::new(path))
    } else {
        Box::new(TextLoader::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn text_loader_reads_file_with_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "hello there").unwrap();

        let items = TextLoader::new(&path).load().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "hello there");
        assert_eq!(
            items[0].metadata.get("url").and_then(|v| v.as_str()),
            Some(path.display().to_string().as_str())
        );
    }

    #[tokio::test]
    async fn missing_pdf_fails_the_load() {
        let dir = TempDir::new().unwrap();
        let err = PdfLoader::new(dir.path().join("nope.pdf"))
            .load()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read PDF"));
    }

    #[tokio::test]
    async fn corrupt_pdf_fails_the_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.pdf");
        fs::write(&path, b"definitely not a pdf").unwrap();
        let err = PdfLoader::new(&path).load().await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse PDF"));
    }

    #[test]
    fn loader_is_chosen_by_extension() {
        assert_eq!(loader_for_path("a/b.PDF").source_label(), "PdfLoader");
        assert_eq!(loader_for_path("a/b.md").source_label(), "TextLoader");
        assert_eq!(loader_for_path("README").source_label(), "TextLoader");
    }
}
