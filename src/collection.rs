//! The vector store facade for one named collection.
//!
//! [`Collection`] ties together the pieces of the pipeline:
//!
//! ```text
//! upsert_content:  items ─▶ extract ─▶ split ─▶ merge source ─▶ embed ─▶ add
//! upsert:          loaders ─▶ load ─▶ split ─▶ tag loader label ─▶ embed ─▶ add
//! query:           text ─▶ embed ─▶ search(k, source filter)
//! qna:             question ─▶ search ─▶ render prompt ─▶ stream chat
//! ```
//!
//! # Collection lifecycle
//!
//! The backing collection is created lazily by [`Collection::ensure_collection`],
//! which every operation calls first. After the first successful call the
//! guard short-circuits, so the backend sees one create request per facade
//! until [`Collection::clear`] resets it. If the collection is dropped behind
//! the facade's back, the backend reports it missing; the guard is reset and
//! the operation retried once against a fresh collection.
//!
//! # Concurrency
//!
//! Embedding and search calls share a semaphore of `max_concurrency`
//! permits. Upserts embed in batches of `batch_size` texts, keeping up to
//! `max_concurrency` batches in flight while preserving chunk order.
//! Concurrent upserts to the same collection are not serialized.

use futures::StreamExt;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};

use crate::chat::ChatModel;
use crate::chunk::TextSplitter;
use crate::embedding::Embedder;
use crate::extract::{extract_batch, ExtractError, ExtractionFilter};
use crate::loader::DocumentLoader;
use crate::models::{merge_metadata, Chunk, RawContentItem, RetrievalFilter, RetrievedDocument, StoredDocument};
use crate::qna::{build_context, render_prompt, AnswerStream, QnaPhase, QnaRequest};
use crate::store::{is_missing_collection, VectorBackend};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error("document loader '{label}' failed: {error:#}")]
    Load { label: String, error: anyhow::Error },
    #[error("collection operation failed: {0:#}")]
    Collection(anyhow::Error),
    #[error("embedding failed: {0:#}")]
    Embedding(anyhow::Error),
    #[error("chat model failed: {0:#}")]
    Chat(anyhow::Error),
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct UpsertReport {
    pub chunks: usize,
    pub ids: Vec<String>,
}

impl UpsertReport {
    fn absorb(&mut self, other: UpsertReport) {
        self.chunks += other.chunks;
        self.ids.extend(other.ids);
    }
}

/// Tunables fixed for the lifetime of a [`Collection`].
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    pub max_concurrency: usize,
    pub batch_size: usize,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_size: 64,
        }
    }
}

pub struct Collection {
    name: String,
    backend: Arc<dyn VectorBackend>,
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
    splitter: TextSplitter,
    permits: Semaphore,
    ensured: Mutex<bool>,
    options: CollectionOptions,
}

impl Collection {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<dyn VectorBackend>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        splitter: TextSplitter,
        options: CollectionOptions,
    ) -> Self {
        let options = CollectionOptions {
            max_concurrency: options.max_concurrency.max(1),
            batch_size: options.batch_size.max(1),
        };
        Self {
            name: name.into(),
            backend,
            embedder,
            chat,
            splitter,
            permits: Semaphore::new(options.max_concurrency),
            ensured: Mutex::new(false),
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn splitter(&self) -> &TextSplitter {
        &self.splitter
    }

    /// Create the backing collection on first use.
    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let mut ensured = self.ensured.lock().await;
        if *ensured {
            return Ok(());
        }
        self.backend
            .ensure_collection(&self.name)
            .await
            .map_err(StoreError::Collection)?;
        *ensured = true;
        tracing::debug!(collection = %self.name, backend = self.backend.name(), "collection ensured");
        Ok(())
    }

    /// Run a backend operation on the collection. When the backend reports
    /// the collection missing, it is ensured again and `op` retried once.
    async fn on_collection<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.ensure_collection().await?;
        match op().await {
            Err(e) if is_missing_collection(&e) => {
                tracing::warn!(collection = %self.name, "collection disappeared, recreating");
                *self.ensured.lock().await = false;
                self.ensure_collection().await?;
                op().await.map_err(StoreError::Collection)
            }
            result => result.map_err(StoreError::Collection),
        }
    }

    /// Ingest every loader in turn, tagging chunks with the loader's label.
    ///
    /// Loaders run one at a time. The report covers all of them.
    pub async fn upsert(
        &self,
        loaders: &[Box<dyn DocumentLoader>],
    ) -> Result<UpsertReport, StoreError> {
        self.ensure_collection().await?;

        let mut report = UpsertReport::default();
        for loader in loaders {
            let label = loader.source_label();
            let items = loader.load().await.map_err(|error| StoreError::Load {
                label: label.clone(),
                error,
            })?;

            let chunks: Vec<Chunk> = items
                .iter()
                .flat_map(|item| {
                    self.splitter
                        .split(&item.content, &merge_metadata(&item.metadata, &label))
                })
                .collect();

            let written = self.write_chunks(chunks).await?;
            tracing::info!(
                collection = %self.name,
                source = %label,
                chunks = written.chunks,
                "loader upserted"
            );
            report.absorb(written);
        }
        Ok(report)
    }

    /// Extract, split and store caller-supplied content as one batch.
    ///
    /// Every item is extracted before anything is written, so a single
    /// extraction failure leaves the collection untouched. Items whose
    /// extracted text is empty contribute no chunks; a batch with no chunks
    /// at all performs no write.
    pub async fn upsert_content(
        &self,
        items: &[RawContentItem],
        filter: &ExtractionFilter,
    ) -> Result<UpsertReport, StoreError> {
        let contents = items.iter().map(|item| item.content.clone()).collect();
        let texts = extract_batch(contents, filter.format.clone()).await?;

        self.ensure_collection().await?;

        let chunks: Vec<Chunk> = texts
            .iter()
            .zip(items)
            .filter(|(text, _)| !text.is_empty())
            .flat_map(|(text, item)| {
                self.splitter
                    .split(text, &merge_metadata(&item.metadata, &filter.source))
            })
            .collect();

        let report = self.write_chunks(chunks).await?;
        tracing::info!(
            collection = %self.name,
            source = %filter.source,
            format = filter.format.name(),
            items = items.len(),
            chunks = report.chunks,
            "upserted content"
        );
        Ok(report)
    }

    async fn write_chunks(&self, chunks: Vec<Chunk>) -> Result<UpsertReport, StoreError> {
        if chunks.is_empty() {
            return Ok(UpsertReport::default());
        }

        let embeddings = self.embed_chunks(&chunks).await?;
        let docs: Vec<StoredDocument> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| StoredDocument {
                id: uuid::Uuid::new_v4().to_string(),
                text: chunk.text,
                metadata: chunk.metadata,
                embedding,
            })
            .collect();

        let ids = self
            .on_collection(|| self.backend.add(&self.name, &docs))
            .await?;
        Ok(UpsertReport {
            chunks: docs.len(),
            ids,
        })
    }

    async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>, StoreError> {
        let batches: Vec<Vec<String>> = chunks
            .chunks(self.options.batch_size)
            .map(|batch| batch.iter().map(|c| c.text.clone()).collect())
            .collect();

        let results: Vec<anyhow::Result<Vec<Vec<f32>>>> = futures::stream::iter(batches)
            .map(|batch| async move {
                let _permit = self.permits.acquire().await?;
                let vectors = self.embedder.embed(&batch).await?;
                if vectors.len() != batch.len() {
                    anyhow::bail!(
                        "embedder returned {} vectors for {} texts",
                        vectors.len(),
                        batch.len()
                    );
                }
                Ok(vectors)
            })
            .buffered(self.options.max_concurrency)
            .collect()
            .await;

        let mut embeddings = Vec::with_capacity(chunks.len());
        for result in results {
            embeddings.extend(result.map_err(StoreError::Embedding)?);
        }
        Ok(embeddings)
    }

    /// The `k` stored chunks most similar to `query`, optionally restricted
    /// to one source. A blank source means no filter.
    pub async fn query(
        &self,
        query: &str,
        source: Option<&str>,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>, StoreError> {
        self.ensure_collection().await?;
        self.search(query, &RetrievalFilter::by_source(source), k)
            .await
    }

    async fn search(
        &self,
        query: &str,
        filter: &RetrievalFilter,
        k: usize,
    ) -> Result<Vec<RetrievedDocument>, StoreError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| StoreError::Collection(e.into()))?;

        let vector = self
            .embedder
            .embed_query(query)
            .await
            .map_err(StoreError::Embedding)?;
        self.on_collection(|| self.backend.search(&self.name, &vector, k, filter))
            .await
    }

    /// Answer `request.question` from retrieved context, streaming the reply.
    pub async fn qna(&self, request: &QnaRequest) -> Result<AnswerStream, StoreError> {
        let result = self.run_qna(request).await;
        if let Err(ref e) = result {
            tracing::debug!(collection = %self.name, phase = %QnaPhase::Failed, error = %e, "qna");
        }
        result
    }

    async fn run_qna(&self, request: &QnaRequest) -> Result<AnswerStream, StoreError> {
        tracing::debug!(collection = %self.name, phase = %QnaPhase::Idle, "qna");
        self.ensure_collection().await?;

        let mode = request.retrieval_mode();
        tracing::debug!(collection = %self.name, phase = %QnaPhase::Retrieving, ?mode, "qna");
        let filter = RetrievalFilter::by_source(request.source.as_deref());
        let candidates = self.search(&request.question, &filter, mode.k()).await?;
        let docs = mode.apply(candidates);

        tracing::debug!(
            collection = %self.name,
            phase = %QnaPhase::PromptBuilding,
            documents = docs.len(),
            "qna"
        );
        let context = build_context(&docs);
        let prompt = render_prompt(
            &request.question,
            &context,
            request.additional_instructions.as_deref(),
        );

        tracing::debug!(collection = %self.name, phase = %QnaPhase::Streaming, model = self.chat.model_name(), "qna");
        let stream = self
            .chat
            .stream_chat(&prompt)
            .await
            .map_err(StoreError::Chat)?;
        Ok(AnswerStream::new(stream))
    }

    /// Delete the whole collection. Returns `false` if it did not exist.
    pub async fn clear(&self) -> Result<bool, StoreError> {
        let mut ensured = self.ensured.lock().await;
        let deleted = self
            .backend
            .delete_collection(&self.name)
            .await
            .map_err(StoreError::Collection)?;
        *ensured = false;
        tracing::info!(collection = %self.name, deleted, "collection cleared");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatStream;
    use crate::extract::ExtractionFormat;
    use crate::store::memory::InMemoryBackend;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds text as letter counts so that similar words land close together.
    struct LetterEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for LetterEmbedder {
        fn model_name(&self) -> &str {
            "letters"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.to_ascii_lowercase().bytes() {
                        if c.is_ascii_lowercase() {
                            v[(c - b'a') as usize] += 1.0;
                        }
                    }
                    v
                })
                .collect())
        }
    }

    struct EchoChat;

    #[async_trait]
    impl ChatModel for EchoChat {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn stream_chat(&self, prompt: &str) -> Result<ChatStream> {
            let parts = vec![Ok("echo:".to_string()), Ok(prompt.to_string())];
            Ok(Box::pin(futures::stream::iter(parts)))
        }
    }

    fn collection(backend: Arc<InMemoryBackend>, batch_size: usize) -> (Collection, Arc<LetterEmbedder>) {
        let embedder = Arc::new(LetterEmbedder {
            calls: AtomicUsize::new(0),
        });
        let c = Collection::new(
            "test",
            backend,
            embedder.clone(),
            Arc::new(EchoChat),
            TextSplitter::new(20, 5).unwrap(),
            CollectionOptions {
                max_concurrency: 2,
                batch_size,
            },
        );
        (c, embedder)
    }

    #[tokio::test]
    async fn ensure_hits_backend_once_until_clear() {
        let backend = Arc::new(InMemoryBackend::new());
        let (c, _) = collection(backend.clone(), 8);

        c.ensure_collection().await.unwrap();
        c.ensure_collection().await.unwrap();
        c.query("x", None, 1).await.unwrap();
        assert_eq!(backend.ensure_calls(), 1);

        assert!(c.clear().await.unwrap());
        c.ensure_collection().await.unwrap();
        assert_eq!(backend.ensure_calls(), 2);
    }

    #[tokio::test]
    async fn collection_dropped_elsewhere_is_recreated() {
        let backend = Arc::new(InMemoryBackend::new());
        let (c, _) = collection(backend.clone(), 8);
        let filter = ExtractionFilter::new(ExtractionFormat::None, "docs");
        c.upsert_content(&[RawContentItem::new("first")], &filter)
            .await
            .unwrap();

        assert!(backend.delete_collection("test").await.unwrap());
        assert!(c.query("first", None, 1).await.unwrap().is_empty());

        assert!(backend.delete_collection("test").await.unwrap());
        let report = c
            .upsert_content(&[RawContentItem::new("second")], &filter)
            .await
            .unwrap();
        assert_eq!(report.chunks, 1);
        assert_eq!(backend.len("test"), Some(1));
        assert_eq!(backend.ensure_calls(), 3);
    }

    #[tokio::test]
    async fn extraction_failure_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let (c, _) = collection(backend.clone(), 8);
        let filter = ExtractionFilter::new(
            ExtractionFormat::Html {
                css_selector: "article".into(),
            },
            "docs",
        );
        let items = vec![
            RawContentItem::new("<article>fine</article>"),
            RawContentItem::new("<p>no article here</p>"),
        ];

        let err = c.upsert_content(&items, &filter).await.unwrap_err();
        assert!(matches!(err, StoreError::Extraction(ExtractError::SelectorEmpty(_))));
        assert_eq!(backend.add_calls(), 0);
        assert_eq!(backend.len("test"), None);
    }

    #[tokio::test]
    async fn embedding_is_batched_in_order() {
        let backend = Arc::new(InMemoryBackend::new());
        let (c, embedder) = collection(backend.clone(), 2);
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let filter = ExtractionFilter::new(ExtractionFormat::None, "greek");

        let report = c
            .upsert_content(&[RawContentItem::new(text)], &filter)
            .await
            .unwrap();

        let expected = c.splitter().split_text(text);
        assert_eq!(report.chunks, expected.len());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), expected.len().div_ceil(2));
        let stored: Vec<String> = backend.documents("test").into_iter().map(|d| d.text).collect();
        assert_eq!(stored, expected);
        assert_eq!(backend.add_calls(), 1);
    }

    #[tokio::test]
    async fn empty_extracted_text_is_skipped() {
        let backend = Arc::new(InMemoryBackend::new());
        let (c, _) = collection(backend.clone(), 8);
        let filter = ExtractionFilter::new(
            ExtractionFormat::Html {
                css_selector: "p".into(),
            },
            "docs",
        );
        let report = c
            .upsert_content(&[RawContentItem::new("<p></p>")], &filter)
            .await
            .unwrap();
        assert_eq!(report, UpsertReport::default());
        assert_eq!(backend.add_calls(), 0);
    }

    #[tokio::test]
    async fn qna_prompt_carries_context() {
        let backend = Arc::new(InMemoryBackend::new());
        let (c, _) = collection(backend, 8);
        let filter = ExtractionFilter::new(ExtractionFormat::None, "docs");
        c.upsert_content(&[RawContentItem::new("rust crates")], &filter)
            .await
            .unwrap();

        let answer: Vec<String> = c
            .qna(&QnaRequest::new("crates?").with_source("docs"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(answer[0], "echo:");
        assert!(answer[1].contains("Context: rust crates\nAnswer:"));
    }
}
