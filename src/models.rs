//! Core data models that flow through ingestion and retrieval.

use serde::{Deserialize, Serialize};

/// Arbitrary caller-supplied key/value metadata attached to content and chunks.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key that carries the provenance tag of a chunk.
pub const SOURCE_KEY: &str = "source";

/// One document as supplied by a caller or a loader, before extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RawContentItem {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RawContentItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A bounded-length piece of extracted text with its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub metadata: Metadata,
}

/// A chunk together with its embedding, ready to be written to a backend.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub embedding: Vec<f32>,
}

/// A chunk returned by similarity search.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RetrievedDocument {
    pub text: String,
    pub metadata: Metadata,
    /// Cosine similarity to the query, `1 - cosine distance`.
    pub score: f32,
}

/// Optional equality filter on the `source` metadata of stored chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalFilter {
    pub source: Option<String>,
}

impl RetrievalFilter {
    /// An empty or missing source means "no filter".
    pub fn by_source(source: Option<&str>) -> Self {
        Self {
            source: source
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        match &self.source {
            None => true,
            Some(wanted) => metadata
                .get(SOURCE_KEY)
                .and_then(|v| v.as_str())
                .map(|s| s == wanted)
                .unwrap_or(false),
        }
    }
}

/// Merge caller metadata with the batch-level source tag.
///
/// The batch `source` always wins over a `source` key supplied by the caller.
pub fn merge_metadata(item: &Metadata, source: &str) -> Metadata {
    let mut merged = item.clone();
    merged.insert(
        SOURCE_KEY.to_string(),
        serde_json::Value::String(source.to_string()),
    );
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_adds_source() {
        let item = RawContentItem::new("x").with_metadata("url", "a");
        let merged = merge_metadata(&item.metadata, "docs");
        assert_eq!(merged.get("url"), Some(&json!("a")));
        assert_eq!(merged.get("source"), Some(&json!("docs")));
    }

    #[test]
    fn batch_source_overrides_caller_source() {
        let item = RawContentItem::new("x").with_metadata("source", "caller");
        let merged = merge_metadata(&item.metadata, "batch");
        assert_eq!(merged.get("source"), Some(&json!("batch")));
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn blank_source_filter_is_empty() {
        assert_eq!(RetrievalFilter::by_source(None), RetrievalFilter::default());
        assert_eq!(RetrievalFilter::by_source(Some("  ")), RetrievalFilter::default());
        assert_eq!(
            RetrievalFilter::by_source(Some("docs")).source.as_deref(),
            Some("docs")
        );
    }

    #[test]
    fn filter_matches_on_source_equality() {
        let filter = RetrievalFilter::by_source(Some("docs"));
        let tagged = merge_metadata(&Metadata::new(), "docs");
        let other = merge_metadata(&Metadata::new(), "blog");
        assert!(filter.matches(&tagged));
        assert!(!filter.matches(&other));
        assert!(!filter.matches(&Metadata::new()));
        assert!(RetrievalFilter::default().matches(&other));
    }
}
