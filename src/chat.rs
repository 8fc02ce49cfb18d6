//! Streaming chat-completion clients.
//!
//! [`ChatModel::stream_chat`] submits one rendered prompt and returns a
//! [`ChatStream`] of text fragments as the model produces them.
//!
//! - **[`OllamaChat`]**: `POST /api/chat` with `stream: true`; the response
//!   body is newline-delimited JSON.
//! - **[`OpenAIChat`]**: `POST /v1/chat/completions` with `stream: true`;
//!   the response body is server-sent events.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ChatConfig;

const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com";

/// Forward-only sequence of response fragments. An `Err` item means the
/// underlying connection failed mid-response.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Submit `prompt` as a single user message and stream the reply.
    async fn stream_chat(&self, prompt: &str) -> Result<ChatStream>;
}

/// Create the chat model named by `config.provider`.
pub fn create_chat_model(config: &ChatConfig) -> Result<Arc<dyn ChatModel>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        other => bail!("Unknown chat provider: {}", other),
    }
}

// ============ Ollama ============

pub struct OllamaChat {
    client: reqwest::Client,
    model: String,
    url: String,
}

impl OllamaChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
        })
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, prompt: &str) -> Result<ChatStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": true,
        });
        let response = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("Ollama connection error (is Ollama running at {}?): {}", self.url, e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let fragments = lines(response.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_ollama_line(&line).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(fragments))
    }
}

/// One NDJSON line → the fragment it carries, if any.
fn parse_ollama_line(line: &str) -> Result<Option<String>> {
    if line.is_empty() {
        return Ok(None);
    }
    let json: serde_json::Value = serde_json::from_str(line)?;
    if let Some(err) = json.get("error").and_then(|e| e.as_str()) {
        bail!("Ollama stream error: {}", err);
    }
    let content = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    Ok((!content.is_empty()).then(|| content.to_string()))
}

// ============ OpenAI ============

/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIChat {
    client: reqwest::Client,
    model: String,
    url: String,
    api_key: String,
}

impl OpenAIChat {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            api_key,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAIChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, prompt: &str) -> Result<ChatStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": true,
        });
        let response = self
            .client
            .post(format!(
                "{}/v1/chat/completions",
                self.url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let fragments = lines(response.bytes_stream()).filter_map(|line| async move {
            match line {
                Ok(line) => parse_sse_line(&line).transpose(),
                Err(e) => Some(Err(e)),
            }
        });
        Ok(Box::pin(fragments))
    }
}

/// One server-sent-event line → the fragment it carries, if any.
fn parse_sse_line(line: &str) -> Result<Option<String>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }
    let json: serde_json::Value = serde_json::from_str(data)?;
    let content = json
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    Ok((!content.is_empty()).then(|| content.to_string()))
}

// ============ Shared ============

/// Re-chunk a byte stream into trimmed text lines. A transport error is
/// yielded once and ends the stream.
fn lines<S, B, E>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                return Some((Ok(line), (bytes, buf, done)));
            }
            if done {
                if buf.is_empty() {
                    return None;
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                return Some((Ok(line), (bytes, buf, done)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(anyhow!("chat stream interrupted: {}", e)), (bytes, buf, true)));
                }
                None => done = true,
            }
        }
    })
}
