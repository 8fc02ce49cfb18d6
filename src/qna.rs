//! Question answering over retrieved context.
//!
//! A Q&A request moves through the phases of [`QnaPhase`]: retrieve
//! documents (top-k or score-threshold, see [`RetrievalMode`]), render the
//! fixed prompt with [`render_prompt`], then stream the model's answer as an
//! [`AnswerStream`].
//!
//! The answer stream is single-pass. If the chat connection fails partway
//! through, the failure is logged and the stream simply ends, so callers see
//! a shorter answer rather than an error. Dropping the stream early releases
//! the underlying HTTP response.

use futures::Stream;
use serde::Deserialize;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::chat::ChatStream;
use crate::models::RetrievedDocument;

fn default_qna_k() -> usize {
    10
}

/// One question plus its retrieval settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QnaRequest {
    pub question: String,
    #[serde(default)]
    pub min_similarity: Option<f32>,
    #[serde(default = "default_qna_k")]
    pub k: usize,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub additional_instructions: Option<String>,
}

impl QnaRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            min_similarity: None,
            k: default_qna_k(),
            source: None,
            additional_instructions: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_min_similarity(mut self, min: f32) -> Self {
        self.min_similarity = Some(min);
        self
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.additional_instructions = Some(instructions.into());
        self
    }

    pub fn retrieval_mode(&self) -> RetrievalMode {
        RetrievalMode::for_request(self.min_similarity, self.k)
    }
}

/// How candidate documents are chosen for the prompt context.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetrievalMode {
    /// Always the `k` nearest documents.
    TopK { k: usize },
    /// Up to `max_k` nearest documents, keeping only those scoring `>= min`.
    ScoreThreshold { min: f32, max_k: usize },
}

impl RetrievalMode {
    /// A missing or non-positive threshold selects plain top-k.
    pub fn for_request(min_similarity: Option<f32>, k: usize) -> Self {
        match min_similarity {
            Some(min) if min > 0.0 => RetrievalMode::ScoreThreshold { min, max_k: k },
            _ => RetrievalMode::TopK { k },
        }
    }

    /// Number of candidates to ask the backend for.
    pub fn k(&self) -> usize {
        match *self {
            RetrievalMode::TopK { k } => k,
            RetrievalMode::ScoreThreshold { max_k, .. } => max_k,
        }
    }

    /// Drop candidates that the mode does not accept.
    pub fn apply(&self, mut docs: Vec<RetrievedDocument>) -> Vec<RetrievedDocument> {
        match *self {
            RetrievalMode::TopK { k } => docs.truncate(k),
            RetrievalMode::ScoreThreshold { min, max_k } => {
                docs.retain(|d| d.score >= min);
                docs.truncate(max_k);
            }
        }
        docs
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QnaPhase {
    Idle,
    Retrieving,
    PromptBuilding,
    Streaming,
    Done,
    Failed,
}

impl fmt::Display for QnaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QnaPhase::Idle => "idle",
            QnaPhase::Retrieving => "retrieving",
            QnaPhase::PromptBuilding => "prompt-building",
            QnaPhase::Streaming => "streaming",
            QnaPhase::Done => "done",
            QnaPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

const PROMPT_PREAMBLE: &str = "You are an assistant for question-answering tasks.
Use the following pieces of retrieved context to answer the question.
If you don't know the answer, just say that you don't know.
If the context is html, make sure to include the id of the page, replace the part of the url from # character.
If the context is code, make sure to include sample code blocks.
Also, make sure to follow the additional instructions on providing the answers, if the additional instructions are provided.
Return the answer in MarkDown format.";

/// Join retrieved document texts into one context block.
pub fn build_context(docs: &[RetrievedDocument]) -> String {
    docs.iter()
        .map(|d| d.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Fill the fixed prompt template.
///
/// The `Additional Instructions:` line is present only when
/// `additional_instructions` has non-whitespace content.
pub fn render_prompt(question: &str, context: &str, additional_instructions: Option<&str>) -> String {
    let mut prompt = String::from(PROMPT_PREAMBLE);
    prompt.push('\n');
    if let Some(extra) = additional_instructions.filter(|s| !s.trim().is_empty()) {
        prompt.push_str("Additional Instructions: ");
        prompt.push_str(extra);
        prompt.push('\n');
    }
    prompt.push_str("Question: ");
    prompt.push_str(question);
    prompt.push_str("\nContext: ");
    prompt.push_str(context);
    prompt.push_str("\nAnswer:");
    prompt
}

/// Streamed answer fragments.
///
/// Yields `String` fragments until the model finishes or the connection
/// fails; a failure is logged at `warn` and ends the stream.
pub struct AnswerStream {
    inner: Option<ChatStream>,
    fragments: usize,
}

impl AnswerStream {
    pub fn new(inner: ChatStream) -> Self {
        Self {
            inner: Some(inner),
            fragments: 0,
        }
    }

    /// Fragments yielded so far.
    pub fn fragments(&self) -> usize {
        self.fragments
    }
}

impl Stream for AnswerStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(fragment))) => {
                self.fragments += 1;
                Poll::Ready(Some(fragment))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(
                    error = %e,
                    fragments = self.fragments,
                    "answer stream interrupted"
                );
                self.inner = None;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                tracing::debug!(phase = %QnaPhase::Done, fragments = self.fragments, "qna");
                self.inner = None;
                Poll::Ready(None)
            }
        }
    }
}
