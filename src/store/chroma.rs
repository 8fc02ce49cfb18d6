//! Chroma vector database over its v1 REST API.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | ensure | `POST /api/v1/collections` with `get_or_create: true` |
//! | add | `POST /api/v1/collections/{id}/add` |
//! | search | `POST /api/v1/collections/{id}/query` |
//! | delete | `DELETE /api/v1/collections/{name}` |
//!
//! Collections are addressed by name in the public API but by id on the
//! wire, so resolved ids are cached per backend instance.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::StoreConfig;
use crate::models::{Metadata, RetrievalFilter, RetrievedDocument, StoredDocument, SOURCE_KEY};

use super::{MissingCollection, VectorBackend};

pub struct ChromaBackend {
    client: reqwest::Client,
    url: String,
    ids: Mutex<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Vec<Vec<Option<Metadata>>>,
    #[serde(default)]
    distances: Vec<Vec<Option<f32>>>,
}

impl ChromaBackend {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            ids: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.url, path)
    }

    fn cached_id(&self, collection: &str) -> Option<String> {
        self.ids
            .lock()
            .ok()
            .and_then(|ids| ids.get(collection).cloned())
    }

    fn forget(&self, collection: &str) {
        if let Ok(mut ids) = self.ids.lock() {
            ids.remove(collection);
        }
    }

    /// Like [`check_status`], but a missing collection evicts the cached id
    /// and surfaces as [`MissingCollection`].
    async fn check_collection_status(
        &self,
        collection: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body_text = response.text().await.unwrap_or_default();
        if reports_missing(status, &body_text) {
            self.forget(collection);
            tracing::debug!(collection, "chroma collection is gone");
            return Err(MissingCollection(collection.to_string()).into());
        }
        bail!("Chroma API error {}: {}", status, body_text)
    }

    /// Resolve `collection` to its Chroma id, creating it if needed.
    async fn collection_id(&self, collection: &str) -> Result<String> {
        if let Some(id) = self.cached_id(collection) {
            return Ok(id);
        }

        let body = json!({
            "name": collection,
            "metadata": { "hnsw:space": "cosine" },
            "get_or_create": true,
        });
        let response = self
            .client
            .post(self.endpoint("collections"))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Chroma connection error (is Chroma running at {}?): {}", self.url, e))?;
        let created: CollectionResponse = check_status(response).await?.json().await?;

        if let Ok(mut ids) = self.ids.lock() {
            ids.insert(collection.to_string(), created.id.clone());
        }
        tracing::debug!(collection, id = %created.id, "resolved chroma collection");
        Ok(created.id)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body_text = response.text().await.unwrap_or_default();
    bail!("Chroma API error {}: {}", status, body_text)
}

/// Chroma answers requests for an unknown collection with a 404 or, on
/// older servers, an error body naming it.
fn reports_missing(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::NOT_FOUND
        || body.contains("does not exist")
        || body.contains("InvalidCollection")
}

/// Chroma metadata values must be strings, numbers or booleans. Anything
/// else is stored as its JSON text.
fn sanitize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => v.clone(),
                other => Value::String(other.to_string()),
            };
            (k.clone(), value)
        })
        .collect()
}

fn where_clause(filter: &RetrievalFilter) -> Option<Value> {
    filter
        .source
        .as_ref()
        .map(|source| {
            let mut clause = serde_json::Map::new();
            clause.insert(SOURCE_KEY.to_string(), Value::String(source.clone()));
            Value::Object(clause)
        })
}

fn parse_query_response(response: QueryResponse) -> Vec<RetrievedDocument> {
    let documents = response.documents.into_iter().next().unwrap_or_default();
    let mut metadatas = response.metadatas.into_iter().next().unwrap_or_default().into_iter();
    let mut distances = response.distances.into_iter().next().unwrap_or_default().into_iter();

    documents
        .into_iter()
        .map(|text| {
            let metadata = metadatas.next().flatten().unwrap_or_default();
            let distance = distances.next().flatten().unwrap_or(1.0);
            RetrievedDocument {
                text: text.unwrap_or_default(),
                metadata,
                score: 1.0 - distance,
            }
        })
        .collect()
}

#[async_trait]
impl VectorBackend for ChromaBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        self.collection_id(collection).await.map(|_| ())
    }

    async fn add(&self, collection: &str, docs: &[StoredDocument]) -> Result<Vec<String>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let id = self.collection_id(collection).await?;

        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        let body = json!({
            "ids": ids,
            "embeddings": docs.iter().map(|d| &d.embedding).collect::<Vec<_>>(),
            "metadatas": docs.iter().map(|d| sanitize_metadata(&d.metadata)).collect::<Vec<_>>(),
            "documents": docs.iter().map(|d| d.text.as_str()).collect::<Vec<_>>(),
        });

        let response = self
            .client
            .post(self.endpoint(&format!("collections/{}/add", id)))
            .json(&body)
            .send()
            .await?;
        self.check_collection_status(collection, response).await?;

        Ok(docs.iter().map(|d| d.id.clone()).collect())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedDocument>> {
        let id = self.collection_id(collection).await?;

        let mut body = json!({
            "query_embeddings": [query],
            "n_results": k,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(clause) = where_clause(filter) {
            body["where"] = clause;
        }

        let response = self
            .client
            .post(self.endpoint(&format!("collections/{}/query", id)))
            .json(&body)
            .send()
            .await?;
        let parsed: QueryResponse = self
            .check_collection_status(collection, response)
            .await?
            .json()
            .await?;
        Ok(parse_query_response(parsed))
    }

    async fn delete_collection(&self, collection: &str) -> Result<bool> {
        self.forget(collection);

        let response = self
            .client
            .delete(self.endpoint(&format!("collections/{}", collection)))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let body_text = response.text().await.unwrap_or_default();
        if reports_missing(status, &body_text) {
            return Ok(false);
        }
        bail!("Chroma API error {}: {}", status, body_text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_is_flattened_to_scalars() {
        let mut meta = Metadata::new();
        meta.insert("url".into(), json!("a"));
        meta.insert("page".into(), json!(3));
        meta.insert("tags".into(), json!(["x", "y"]));
        meta.insert("gone".into(), Value::Null);

        let clean = sanitize_metadata(&meta);
        assert_eq!(clean.get("url"), Some(&json!("a")));
        assert_eq!(clean.get("page"), Some(&json!(3)));
        assert_eq!(clean.get("tags"), Some(&json!(r#"["x","y"]"#)));
        assert!(!clean.contains_key("gone"));
    }

    #[test]
    fn where_clause_only_for_source() {
        assert_eq!(where_clause(&RetrievalFilter::default()), None);
        assert_eq!(
            where_clause(&RetrievalFilter::by_source(Some("docs"))),
            Some(json!({ "source": "docs" }))
        );
    }

    #[test]
    fn query_response_distances_become_scores() {
        let raw = json!({
            "ids": [["1", "2"]],
            "documents": [["alpha", "beta"]],
            "metadatas": [[{ "source": "docs" }, null]],
            "distances": [[0.25, 0.5]]
        });
        let parsed: QueryResponse = serde_json::from_value(raw).unwrap();
        let docs = parse_query_response(parsed);

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "alpha");
        assert!((docs[0].score - 0.75).abs() < 1e-6);
        assert_eq!(docs[0].metadata.get("source"), Some(&json!("docs")));
        assert!(docs[1].metadata.is_empty());
        assert!((docs[1].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn missing_collection_responses() {
        use reqwest::StatusCode;
        assert!(reports_missing(StatusCode::NOT_FOUND, ""));
        assert!(reports_missing(
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"InvalidCollection","message":"Collection abc does not exist."}"#
        ));
        assert!(!reports_missing(StatusCode::INTERNAL_SERVER_ERROR, "disk full"));
        assert!(!reports_missing(StatusCode::BAD_REQUEST, "bad embedding dimension"));
    }

    #[test]
    fn forget_evicts_cached_id() {
        let backend = ChromaBackend::new(&StoreConfig::default()).unwrap();
        backend
            .ids
            .lock()
            .unwrap()
            .insert("kb".to_string(), "id-1".to_string());
        assert_eq!(backend.cached_id("kb").as_deref(), Some("id-1"));
        backend.forget("kb");
        assert_eq!(backend.cached_id("kb"), None);
    }

    #[test]
    fn empty_query_response_has_no_documents() {
        let parsed: QueryResponse = serde_json::from_value(json!({})).unwrap();
        assert!(parse_query_response(parsed).is_empty());
    }
}
