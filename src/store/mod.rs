//! Vector database backends.
//!
//! The [`VectorBackend`] trait is the narrow interface the collection facade
//! needs from an external vector database: create a collection, add
//! embedded documents, run a filtered similarity search, and drop the
//! collection. Embedding happens before documents reach the backend.
//!
//! Collections are always created with the cosine distance space; scores
//! returned by [`VectorBackend::search`] are cosine similarities
//! (`1 - cosine distance`), highest first.
//!
//! | Backend | Purpose |
//! |---------|---------|
//! | [`chroma::ChromaBackend`] | Chroma server over its REST API |
//! | [`memory::InMemoryBackend`] | Brute-force in-process store for tests and local runs |

pub mod chroma;
pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::models::{RetrievalFilter, RetrievedDocument, StoredDocument};

/// The backend has no collection by this name, e.g. because it was dropped
/// by another process. Backends return it wrapped in `anyhow::Error`.
#[derive(Debug, thiserror::Error)]
#[error("collection {0} does not exist")]
pub struct MissingCollection(pub String);

/// Whether `error` is (or wraps) a [`MissingCollection`].
pub fn is_missing_collection(error: &anyhow::Error) -> bool {
    error.downcast_ref::<MissingCollection>().is_some()
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Backend identifier for logs (e.g. `"chroma"`).
    fn name(&self) -> &str;

    /// Create `collection` if it does not exist; otherwise do nothing.
    async fn ensure_collection(&self, collection: &str) -> Result<()>;

    /// Persist `docs`, returning their ids in input order. Fails with
    /// [`MissingCollection`] if `collection` is gone.
    async fn add(&self, collection: &str, docs: &[StoredDocument]) -> Result<Vec<String>>;

    /// Return up to `k` documents most similar to `query`, best first.
    async fn search(
        &self,
        collection: &str,
        query: &[f32],
        k: usize,
        filter: &RetrievalFilter,
    ) -> Result<Vec<RetrievedDocument>>;

    /// Drop `collection`. Returns `false` when it did not exist.
    async fn delete_collection(&self, collection: &str) -> Result<bool>;
}

/// Create the backend named by `config.backend`.
pub fn create_backend(config: &StoreConfig) -> Result<Arc<dyn VectorBackend>> {
    match config.backend.as_str() {
        "chroma" => Ok(Arc::new(chroma::ChromaBackend::new(config)?)),
        "memory" => Ok(Arc::new(memory::InMemoryBackend::new())),
        other => bail!("Unknown store backend: {}", other),
    }
}
