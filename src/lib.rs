//! # docqa
//!
//! A retrieval-augmented question-answering backend. Documents (HTML,
//! Markdown, XML, PDF, plain text) are extracted, split into overlapping
//! chunks, embedded and stored in a vector database. Questions are answered
//! by retrieving the most similar chunks and streaming a language model's
//! reply.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌──────────┐
//! │ Extract  │──▶│  Chunk   │──▶│ Collection │──▶│  Chroma  │
//! │ html/md/ │   │ splitter │   │  (facade)  │   │ / memory │
//! │ xml/pdf  │   └──────────┘   └─────┬──────┘   └──────────┘
//! └──────────┘                        │
//!                      ┌──────────────┼──────────────┐
//!                      ▼              ▼              ▼
//!                 ┌─────────┐   ┌──────────┐   ┌──────────┐
//!                 │Embedder │   │   QnA    │──▶│   Chat   │
//!                 └─────────┘   └────┬─────┘   └──────────┘
//!                                    ▼
//!                          ┌───────────────────┐
//!                          │ HTTP / WebSocket  │
//!                          └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`models`] | Core data types |
//! | [`extract`] | Format-specific text extraction |
//! | [`chunk`] | Recursive character text splitter |
//! | [`loader`] | Document loaders (PDF, text) |
//! | [`embedding`] | Embedding provider clients |
//! | [`chat`] | Streaming chat-completion clients |
//! | [`store`] | Vector database backends |
//! | [`collection`] | Per-collection facade: upsert, query, qna, clear |
//! | [`qna`] | Retrieval modes, prompt rendering, answer stream |
//! | [`engine`] | Shared clients and collection cache |
//! | [`server`] | HTTP and WebSocket transport |

pub mod chat;
pub mod chunk;
pub mod collection;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod extract;
pub mod loader;
pub mod models;
pub mod qna;
pub mod server;
pub mod store;
