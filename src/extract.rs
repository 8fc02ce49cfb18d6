//! Format-specific text extraction.
//!
//! Callers supply raw content plus an [`ExtractionFormat`]; this module
//! returns the plain text that is handed to the chunker. PDF bytes are
//! handled separately by [`extract_pdf`] since they never arrive as text.
//!
//! Parsing is CPU-bound. Async callers go through [`extract_batch`] and
//! [`extract_pdf_blocking`], which run on tokio's blocking pool.

use quick_xml::events::Event;
use quick_xml::{Reader, Writer};
use scraper::{Html, Selector};
use thiserror::Error;

/// How to pull text out of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExtractionFormat {
    /// Pass the content through unchanged.
    #[default]
    None,
    /// Text of the nodes matching `css_selector`, or of `<body>` when empty.
    Html { css_selector: String },
    /// Render to HTML, then take the full text.
    Markdown,
    /// String value of the first node matched by `xpath`.
    Xml { xpath: String },
}

impl ExtractionFormat {
    /// Build a format from its wire descriptor (`"html"`, `"md"`, `"xml"`, ...).
    ///
    /// Unrecognized formats fall back to [`ExtractionFormat::None`].
    pub fn from_descriptor(format: &str, selector: Option<&str>) -> Self {
        let selector = selector.unwrap_or_default().trim().to_string();
        match format.trim().to_ascii_lowercase().as_str() {
            "html" => ExtractionFormat::Html {
                css_selector: selector,
            },
            "md" | "markdown" => ExtractionFormat::Markdown,
            "xml" => ExtractionFormat::Xml { xpath: selector },
            _ => ExtractionFormat::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExtractionFormat::None => "none",
            ExtractionFormat::Html { .. } => "html",
            ExtractionFormat::Markdown => "markdown",
            ExtractionFormat::Xml { .. } => "xml",
        }
    }
}

/// Extraction settings for a whole upsert batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtractionFilter {
    pub format: ExtractionFormat,
    /// Provenance tag written into every chunk of the batch.
    pub source: String,
}

impl ExtractionFilter {
    pub fn new(format: ExtractionFormat, source: impl Into<String>) -> Self {
        Self {
            format,
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid HTML selector: {0}")]
    Html(String),
    #[error("HTML selector '{0}' matched no elements")]
    SelectorEmpty(String),
    #[error("invalid XML content: {0}")]
    Xml(String),
    #[error("invalid XPath expression: {0}")]
    XPath(String),
    #[error("XPath query '{0}' returned no results")]
    XPathEmpty(String),
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("{format} extraction aborted: {reason}")]
    Aborted { format: &'static str, reason: String },
}

impl ExtractError {
    /// Short label of the failing format, used in logs and error messages.
    pub fn format(&self) -> &'static str {
        match self {
            ExtractError::Html(_) | ExtractError::SelectorEmpty(_) => "html",
            ExtractError::Xml(_) | ExtractError::XPath(_) => "xml",
            ExtractError::XPathEmpty(_) => "xpath-empty",
            ExtractError::Pdf(_) => "pdf",
            ExtractError::Aborted { format, .. } => format,
        }
    }
}

/// Extract plain text from `content` according to `format`.
pub fn extract(content: &str, format: &ExtractionFormat) -> Result<String, ExtractError> {
    let result = match format {
        ExtractionFormat::None => Ok(content.to_string()),
        ExtractionFormat::Html { css_selector } => extract_html(content, css_selector),
        ExtractionFormat::Markdown => Ok(extract_markdown(content)),
        ExtractionFormat::Xml { xpath } => extract_xml(content, xpath),
    };

    if let Err(ref e) = result {
        tracing::warn!(format = e.format(), error = %e, "extraction failed");
    }
    result
}

fn extract_html(content: &str, css_selector: &str) -> Result<String, ExtractError> {
    let document = Html::parse_document(content);

    let (selector_str, must_match) = if css_selector.trim().is_empty() {
        ("body", false)
    } else {
        (css_selector.trim(), true)
    };

    let selector = Selector::parse(selector_str)
        .map_err(|e| ExtractError::Html(format!("{}: {}", selector_str, e)))?;

    let mut matched = 0usize;
    let mut out = String::new();
    for element in document.select(&selector) {
        matched += 1;
        out.extend(element.text());
    }

    if matched == 0 && must_match {
        return Err(ExtractError::SelectorEmpty(selector_str.to_string()));
    }
    Ok(out)
}

fn extract_markdown(content: &str) -> String {
    let parser = pulldown_cmark::Parser::new(content);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);

    let document = Html::parse_document(&html);
    document.root_element().text().collect()
}

fn extract_xml(content: &str, xpath: &str) -> Result<String, ExtractError> {
    let cleaned = reserialize_xml(content)?;

    let package =
        sxd_document::parser::parse(&cleaned).map_err(|e| ExtractError::Xml(format!("{:?}", e)))?;
    let document = package.as_document();

    let value = sxd_xpath::evaluate_xpath(&document, xpath)
        .map_err(|e| ExtractError::XPath(format!("{}: {:?}", xpath, e)))?;

    match value {
        sxd_xpath::Value::Nodeset(nodes) => nodes
            .document_order_first()
            .map(|node| node.string_value())
            .ok_or_else(|| ExtractError::XPathEmpty(xpath.to_string())),
        other => Ok(other.string()),
    }
}

/// Parse `content` and write it back without declarations, comments,
/// processing instructions, doctypes or whitespace-only text. Other text is
/// written unchanged, so spaces inside mixed content survive.
fn reserialize_xml(content: &str) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(content);
    let mut writer = Writer::new(Vec::new());
    let mut saw_root = false;

    loop {
        let event = match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_)) => continue,
            Ok(Event::Text(text)) if text.iter().all(u8::is_ascii_whitespace) => continue,
            Ok(e @ (Event::Start(_) | Event::Empty(_))) => {
                saw_root = true;
                e
            }
            Ok(e) => e,
            Err(e) => {
                return Err(ExtractError::Xml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        };
        writer
            .write_event(event)
            .map_err(|e| ExtractError::Xml(e.to_string()))?;
    }

    if !saw_root {
        return Err(ExtractError::Xml("document has no root element".to_string()));
    }

    String::from_utf8(writer.into_inner()).map_err(|e| ExtractError::Xml(e.to_string()))
}

/// Extract plain text from PDF bytes.
pub fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Run `parse` on the blocking pool. A panic inside it becomes
/// [`ExtractError::Aborted`] tagged with `format`.
pub async fn run_blocking<T, F>(format: &'static str, parse: F) -> Result<T, ExtractError>
where
    F: FnOnce() -> Result<T, ExtractError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(parse).await.map_err(|e| {
        tracing::warn!(format, error = %e, "extraction task failed");
        ExtractError::Aborted {
            format,
            reason: e.to_string(),
        }
    })?
}

/// [`extract`] every item of a batch, stopping at the first failure.
pub async fn extract_batch(
    contents: Vec<String>,
    format: ExtractionFormat,
) -> Result<Vec<String>, ExtractError> {
    let name = format.name();
    run_blocking(name, move || {
        contents
            .iter()
            .map(|content| extract(content, &format))
            .collect()
    })
    .await
}

/// [`extract_pdf`] on the blocking pool.
pub async fn extract_pdf_blocking(bytes: Vec<u8>) -> Result<String, ExtractError> {
    run_blocking("pdf", move || extract_pdf(&bytes)).await
}
