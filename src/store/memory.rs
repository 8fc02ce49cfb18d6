//! In-memory [`VectorBackend`] for tests and local runs.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`. Search is
//! brute-force cosine similarity over every stored vector.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{RetrievalFilter, RetrievedDocument, StoredDocument};

use super::{MissingCollection, VectorBackend};

pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, Vec<StoredDocument>>>,
    ensure_calls: AtomicUsize,
    add_calls: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            ensure_calls: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
        }
    }

    /// Number of documents in `collection`, or `None` if it does not exist.
    pub fn len(&self, collection: &str) -> Option<usize> {
        self.collections
            .read()
            .ok()
            .and_then(|c| c.get(collection).map(Vec::len))
    }

    /// All documents in `collection`, in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.collections
            .read()
            .ok()
            .and_then(|c| c.get(collection).cloned())
            .unwrap_or_default()
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::SeqCst)
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, collection: &str) -> Result<()> {
        self.ensure_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().map_err(poisoned)?;
        collections.entry(collection.to_string()).or_default();
        Ok(())
    }

    async fn add(&self, collection: &str, docs: &[StoredDocument]) -> Result<Vec<String>> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        let mut collections = self.collections.write().map_err(poisoned)?;
        let stored = collections
            .get_mut(collection)
            .ok_or_else(|| MissingCollection(collection.to_string()))?;
        stored.extend(docs.iter().cloned());
        Ok(docs.iter().map(|d| d.id.clone()).collect())
    }

    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedDocument>> {
        let collections = self.collections.read().map_err(poisoned)?;
        let stored = collections
            .get(collection)
            .ok_or_else(|| MissingCollection(collection.to_string()))?;

        let mut results: Vec<RetrievedDocument> = stored
            .iter()
            .filter(|doc| filter.matches(&doc.metadata))
            .map(|doc| RetrievedDocument {
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score: cosine_similarity(query, &doc.embedding),
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);
        Ok(results)
    }

    async fn delete_collection(&self, collection: &str) -> Result<bool> {
        let mut collections = self.collections.write().map_err(poisoned)?;
        Ok(collections.remove(collection).is_some())
    }
}
