//! Shared service handles and the per-name [`Collection`] cache.
//!
//! One [`Engine`] is built at startup from the [`Config`]. Transports ask it
//! for a collection by name; the same facade is handed out for every request
//! naming that collection, so the lazy ensure-guard is shared.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::chat::{create_chat_model, ChatModel};
use crate::chunk::TextSplitter;
use crate::collection::{Collection, CollectionOptions};
use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::store::{create_backend, VectorBackend};

pub struct Engine {
    config: Config,
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    collections: Mutex<HashMap<String, Arc<Collection>>>,
}

impl Engine {
    /// Build every service client named by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend = create_backend(&config.store)?;
        let embedder = create_embedder(&config.embedding)?;
        let chat = create_chat_model(&config.chat)?;
        Self::new(config.clone(), backend, embedder, chat)
    }

    pub fn new(
        config: Config,
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
    ) -> Result<Self> {
        // Fail at startup rather than on the first request.
        TextSplitter::new(config.chunking.chunk_size, config.chunking.chunk_overlap)?;
        tracing::info!(
            backend = backend.name(),
            embedding_model = embedder.model_name(),
            chat_model = chat.model_name(),
            "engine ready"
        );
        Ok(Self {
            config,
            backend,
            embedder,
            chat,
            collections: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The facade for `name`, created on first request.
    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        let mut collections = self
            .collections
            .lock()
            .map_err(|_| anyhow::anyhow!("collection cache lock poisoned"))?;
        if let Some(existing) = collections.get(name) {
            return Ok(existing.clone());
        }

        let splitter = TextSplitter::new(
            self.config.chunking.chunk_size,
            self.config.chunking.chunk_overlap,
        )?;
        let collection = Arc::new(Collection::new(
            name,
            self.backend.clone(),
            self.embedder.clone(),
            self.chat.clone(),
            splitter,
            CollectionOptions {
                max_concurrency: self.config.retrieval.max_concurrency,
                batch_size: self.config.embedding.batch_size,
            },
        ));
        collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }
}
