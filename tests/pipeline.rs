//! End-to-end tests of the ingestion and question-answering pipeline over
//! the in-memory backend, with fake embedding and chat services.

mod support;

use docqa::extract::{ExtractError, ExtractionFilter, ExtractionFormat};
use docqa::collection::StoreError;
use docqa::loader::{DocumentLoader, TextLoader};
use docqa::models::RawContentItem;
use docqa::qna::QnaRequest;
use docqa::store::VectorBackend;
use futures::StreamExt;
use serde_json::json;
use support::{harness, ScriptedChat};
use tempfile::TempDir;

fn html(selector: &str, source: &str) -> ExtractionFilter {
    ExtractionFilter::new(
        ExtractionFormat::Html {
            css_selector: selector.to_string(),
        },
        source,
    )
}

fn plain(source: &str) -> ExtractionFilter {
    ExtractionFilter::new(ExtractionFormat::None, source)
}

#[tokio::test]
async fn html_paragraph_becomes_one_tagged_chunk() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();

    let item = RawContentItem::new("<p>Hello world</p>").with_metadata("url", "a");
    let report = collection
        .upsert_content(&[item], &html("p", "docs"))
        .await
        .unwrap();

    assert_eq!(report.chunks, 1);
    assert_eq!(report.ids.len(), 1);

    let stored = h.backend.documents("kb");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "Hello world");
    assert_eq!(
        serde_json::Value::Object(stored[0].metadata.clone()),
        json!({ "url": "a", "source": "docs" })
    );
}

#[tokio::test]
async fn batch_source_overrides_item_source() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();

    let item = RawContentItem::new("rust").with_metadata("source", "caller");
    collection.upsert_content(&[item], &plain("batch")).await.unwrap();

    let stored = h.backend.documents("kb");
    assert_eq!(stored[0].metadata.get("source"), Some(&json!("batch")));
}

#[tokio::test]
async fn empty_upsert_is_a_no_op() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();

    let report = collection.upsert_content(&[], &plain("docs")).await.unwrap();
    assert_eq!(report.chunks, 0);
    assert!(report.ids.is_empty());
    assert_eq!(h.backend.add_calls(), 0);
}

#[tokio::test]
async fn xpath_miss_fails_the_whole_batch() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    let filter = ExtractionFilter::new(
        ExtractionFormat::Xml {
            xpath: "//title".to_string(),
        },
        "feed",
    );
    let items = vec![
        RawContentItem::new("<doc><title>Alpha</title></doc>"),
        RawContentItem::new("<doc><body>no title</body></doc>"),
    ];

    let err = collection.upsert_content(&items, &filter).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Extraction(ExtractError::XPathEmpty(_))
    ));
    assert_eq!(h.backend.add_calls(), 0);
}

#[tokio::test]
async fn markdown_is_stored_as_plain_text() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    let filter = ExtractionFilter::new(ExtractionFormat::Markdown, "md");

    collection
        .upsert_content(&[RawContentItem::new("# Hello\n\n**world**")], &filter)
        .await
        .unwrap();

    let stored = h.backend.documents("kb");
    assert_eq!(stored.len(), 1);
    assert!(stored[0].text.contains("Hello"));
    assert!(stored[0].text.contains("world"));
    assert!(!stored[0].text.contains("**"));
}

#[tokio::test]
async fn query_filters_by_source() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    collection
        .upsert_content(&[RawContentItem::new("rust alpha")], &plain("a"))
        .await
        .unwrap();
    collection
        .upsert_content(&[RawContentItem::new("rust beta")], &plain("b"))
        .await
        .unwrap();

    let all = collection.query("rust", None, 10).await.unwrap();
    assert_eq!(all.len(), 2);

    let only_a = collection.query("rust", Some("a"), 10).await.unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].text, "rust alpha");

    let blank = collection.query("rust", Some(""), 10).await.unwrap();
    assert_eq!(blank.len(), 2);
}

async fn seed_greek(h: &support::Harness) {
    let collection = h.engine.collection("kb").unwrap();
    let items = vec![
        RawContentItem::new("alpha beta"),
        RawContentItem::new("alpha gamma"),
        RawContentItem::new("delta"),
    ];
    collection.upsert_content(&items, &plain("greek")).await.unwrap();
}

#[tokio::test]
async fn score_threshold_excludes_weak_matches() {
    let h = harness(ScriptedChat::new(&["ok"]));
    seed_greek(&h).await;
    let collection = h.engine.collection("kb").unwrap();

    let request = QnaRequest::new("alpha beta").with_min_similarity(0.6);
    let answer: Vec<String> = collection.qna(&request).await.unwrap().collect().await;
    assert_eq!(answer, vec!["ok"]);

    let prompt = h.chat.prompt();
    assert!(prompt.contains("Context: alpha beta\nAnswer:"));
    assert!(!prompt.contains("alpha gamma"));
    assert!(!prompt.contains("delta"));
}

#[tokio::test]
async fn zero_threshold_uses_top_k() {
    let h = harness(ScriptedChat::new(&["ok"]));
    seed_greek(&h).await;
    let collection = h.engine.collection("kb").unwrap();

    let request = QnaRequest::new("alpha beta").with_min_similarity(0.0).with_k(2);
    let _: Vec<String> = collection.qna(&request).await.unwrap().collect().await;

    let prompt = h.chat.prompt();
    assert!(prompt.contains("Context: alpha beta\n\nalpha gamma\nAnswer:"));
    assert!(!prompt.contains("delta"));
}

#[tokio::test]
async fn additional_instructions_reach_the_prompt() {
    let h = harness(ScriptedChat::new(&["ok"]));
    let collection = h.engine.collection("kb").unwrap();

    let request = QnaRequest::new("hello").with_instructions("Answer in one line.");
    let _: Vec<String> = collection.qna(&request).await.unwrap().collect().await;
    assert!(h
        .chat
        .prompt()
        .contains("Additional Instructions: Answer in one line.\nQuestion: hello"));
}

#[tokio::test]
async fn interrupted_answer_ends_early_without_error() {
    let h = harness(ScriptedChat::interrupted(&["Par", "tial"]));
    let collection = h.engine.collection("kb").unwrap();

    let answer: String = collection
        .qna(&QnaRequest::new("hello"))
        .await
        .unwrap()
        .collect::<Vec<_>>()
        .await
        .concat();
    assert_eq!(answer, "Partial");
}

#[tokio::test]
async fn abandoning_the_answer_is_fine() {
    let h = harness(ScriptedChat::new(&["one", "two", "three"]));
    let collection = h.engine.collection("kb").unwrap();

    let mut answer = collection.qna(&QnaRequest::new("hello")).await.unwrap();
    assert_eq!(answer.next().await.as_deref(), Some("one"));
    drop(answer);

    // The facade is still usable afterwards.
    assert!(collection.query("hello", None, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn clear_on_missing_collection_reports_false() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("never-created").unwrap();
    assert!(!collection.clear().await.unwrap());
}

#[tokio::test]
async fn clear_then_reuse_recreates_collection() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    collection
        .upsert_content(&[RawContentItem::new("rust")], &plain("docs"))
        .await
        .unwrap();

    assert!(collection.clear().await.unwrap());
    assert_eq!(h.backend.len("kb"), None);

    collection
        .upsert_content(&[RawContentItem::new("python")], &plain("docs"))
        .await
        .unwrap();
    assert_eq!(h.backend.len("kb"), Some(1));
    assert_eq!(h.backend.ensure_calls(), 2);
}

#[tokio::test]
async fn collection_dropped_outside_the_engine_recovers() {
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    collection
        .upsert_content(&[RawContentItem::new("rust")], &plain("docs"))
        .await
        .unwrap();

    // Another process (e.g. `docqa clear`) drops it directly.
    assert!(h.backend.delete_collection("kb").await.unwrap());

    let report = h
        .engine
        .collection("kb")
        .unwrap()
        .upsert_content(&[RawContentItem::new("python")], &plain("docs"))
        .await
        .unwrap();
    assert_eq!(report.chunks, 1);
    assert_eq!(h.backend.len("kb"), Some(1));

    assert!(h.backend.delete_collection("kb").await.unwrap());
    let results = collection.query("python", None, 3).await.unwrap();
    assert!(results.is_empty());
    assert_eq!(h.backend.len("kb"), Some(0));
}

#[tokio::test]
async fn ensure_runs_once_across_operations() {
    let h = harness(ScriptedChat::new(&["ok"]));
    let collection = h.engine.collection("kb").unwrap();

    collection
        .upsert_content(&[RawContentItem::new("rust")], &plain("docs"))
        .await
        .unwrap();
    collection.query("rust", None, 3).await.unwrap();
    let _: Vec<String> = collection
        .qna(&QnaRequest::new("rust"))
        .await
        .unwrap()
        .collect()
        .await;

    // A second handle for the same name shares the guard.
    h.engine.collection("kb").unwrap().query("rust", None, 1).await.unwrap();
    assert_eq!(h.backend.ensure_calls(), 1);
}

#[tokio::test]
async fn upsert_accumulates_every_loader() {
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");
    std::fs::write(&first, "alpha").unwrap();
    std::fs::write(&second, "beta").unwrap();

    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    let loaders: Vec<Box<dyn DocumentLoader>> = vec![
        Box::new(TextLoader::new(&first)),
        Box::new(TextLoader::new(&second)),
    ];

    let report = collection.upsert(&loaders).await.unwrap();
    assert_eq!(report.chunks, 2);
    assert_eq!(report.ids.len(), 2);

    let stored = h.backend.documents("kb");
    let texts: Vec<&str> = stored.iter().map(|d| d.text.as_str()).collect();
    assert_eq!(texts, vec!["alpha", "beta"]);
    assert!(stored
        .iter()
        .all(|d| d.metadata.get("source") == Some(&json!("TextLoader"))));
}

#[tokio::test]
async fn failing_loader_aborts_upsert() {
    let dir = TempDir::new().unwrap();
    let h = harness(ScriptedChat::new(&[]));
    let collection = h.engine.collection("kb").unwrap();
    let loaders: Vec<Box<dyn DocumentLoader>> =
        vec![Box::new(TextLoader::new(dir.path().join("missing.txt")))];

    let err = collection.upsert(&loaders).await.unwrap_err();
    assert!(matches!(err, StoreError::Load { .. }));
    assert_eq!(h.backend.add_calls(), 0);
}
