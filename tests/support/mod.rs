//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use docqa::chat::{ChatModel, ChatStream};
use docqa::config::Config;
use docqa::embedding::Embedder;
use docqa::engine::Engine;
use docqa::store::memory::InMemoryBackend;
use std::sync::{Arc, Mutex};

const VOCABULARY: [&str; 8] = [
    "alpha", "beta", "gamma", "delta", "rust", "python", "hello", "world",
];

/// One dimension per vocabulary word; other words are ignored.
pub struct VocabEmbedder;

#[async_trait]
impl Embedder for VocabEmbedder {
    fn model_name(&self) -> &str {
        "vocab"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; VOCABULARY.len()];
                for word in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    if let Some(i) = VOCABULARY.iter().position(|known| *known == word) {
                        v[i] += 1.0;
                    }
                }
                v
            })
            .collect())
    }
}

pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("embedding service unavailable")
    }
}

/// Replays fixed fragments, optionally failing after them, and records the
/// last prompt it was given.
pub struct ScriptedChat {
    fragments: Vec<String>,
    fail_after: bool,
    pub last_prompt: Mutex<Option<String>>,
}

impl ScriptedChat {
    pub fn new(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|s| s.to_string()).collect(),
            fail_after: false,
            last_prompt: Mutex::new(None),
        }
    }

    pub fn interrupted(fragments: &[&str]) -> Self {
        Self {
            fail_after: true,
            ..Self::new(fragments)
        }
    }

    pub fn prompt(&self) -> String {
        self.last_prompt.lock().unwrap().clone().unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, prompt: &str) -> Result<ChatStream> {
        *self.last_prompt.lock().unwrap() = Some(prompt.to_string());
        let mut items: Vec<Result<String>> = self.fragments.iter().cloned().map(Ok).collect();
        if self.fail_after {
            items.push(Err(anyhow::anyhow!("connection reset by peer")));
            items.push(Ok("unreachable".to_string()));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub backend: Arc<InMemoryBackend>,
    pub chat: Arc<ScriptedChat>,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.backend = "memory".to_string();
    config.chunking.chunk_size = 1000;
    config.chunking.chunk_overlap = 10;
    config
}

pub fn harness(chat: ScriptedChat) -> Harness {
    harness_with(test_config(), Arc::new(VocabEmbedder), chat)
}

pub fn harness_with(config: Config, embedder: Arc<dyn Embedder>, chat: ScriptedChat) -> Harness {
    let backend = Arc::new(InMemoryBackend::new());
    let chat = Arc::new(chat);
    let engine = Engine::new(config, backend.clone(), embedder, chat.clone()).unwrap();
    Harness {
        engine: Arc::new(engine),
        backend,
        chat,
    }
}
