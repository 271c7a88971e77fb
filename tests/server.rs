//! HTTP tests against a server bound to an ephemeral port, backed by the
//! in-memory broker and store.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use ragline::broker::memory::MemoryBus;
use ragline::completion::{CompletionService, DisabledCompletion};
use ragline::config::{CompletionConfig, Config};
use ragline::embedding::Embedder;
use ragline::models::{DocumentMessage, UserMessage, VectorRecord};
use ragline::prompt::{PromptComposer, NO_DOCUMENTS_RESPONSE};
use ragline::publisher::Publisher;
use ragline::rag::RagService;
use ragline::retrieve::Retriever;
use ragline::server::{serve, AppState};
use ragline::store::memory::MemoryStore;
use ragline::store::{CollectionSchema, VectorStore};

struct FlatEmbedder;

#[async_trait]
impl Embedder for FlatEmbedder {
    fn model_name(&self) -> &str {
        "flat"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 1.0]).collect())
    }
}

struct TestServer {
    base: String,
    bus: MemoryBus,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start(completion: Arc<dyn CompletionService>) -> TestServer {
    let config = Config::default();
    let bus = MemoryBus::new();

    let store = Arc::new(MemoryStore::new());
    store
        .ensure_collection(&CollectionSchema::new("DocumentChunk", 2))
        .await
        .unwrap();
    store
        .insert(
            "DocumentChunk",
            &VectorRecord::new("DocumentChunk", "Refunds take 14 days.".into(), vec![1.0, 0.9]),
        )
        .await
        .unwrap();

    let rag = RagService::new(
        Retriever::new(Arc::new(FlatEmbedder), store, "DocumentChunk", 3),
        PromptComposer::from_config(&CompletionConfig::default()),
        completion,
    );
    let publisher = Publisher::new(Arc::new(bus.connector()));
    publisher
        .bootstrap(&config.broker.topology())
        .await
        .unwrap();

    let state = AppState {
        rag: Arc::new(rag),
        publisher: Arc::new(publisher),
        document_queue: config.broker.document_queue.clone(),
        user_message_queue: config.broker.user_message_queue.clone(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let handle = tokio::spawn(async move {
        let origins: Vec<String> = Vec::new();
        serve(listener, state, &origins, token).await
    });

    TestServer {
        base,
        bus,
        shutdown,
        handle,
    }
}

#[tokio::test]
async fn test_health() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    server.stop().await;
}

#[tokio::test]
async fn test_send_message_is_queued() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/send-message", server.base))
        .json(&json!({ "text": "hello", "user_id": "u-7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "Message queued successfully");

    let queued = server.bus.take("user_message_queue");
    assert_eq!(queued.len(), 1);
    let message: UserMessage = serde_json::from_slice(&queued[0]).unwrap();
    assert_eq!(message.user_id, "u-7");
    assert_eq!(message.text, "hello");
    assert!(message.timestamp.is_some());
    server.stop().await;
}

#[tokio::test]
async fn test_send_message_requires_user_id() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/send-message", server.base))
        .json(&json!({ "text": "hello", "user_id": " " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(server.bus.ready_count("user_message_queue"), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_send_message_requires_text() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/send-message", server.base))
        .json(&json!({ "text": "  ", "user_id": "u-7" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["message"].as_str().unwrap().contains("text"));
    assert_eq!(server.bus.ready_count("user_message_queue"), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_ingest_queues_document() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/ingest", server.base))
        .json(&json!({ "text": "Hello world", "source": "a.pdf" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let queued = server.bus.take("rag_queue");
    assert_eq!(queued.len(), 1);
    let message: DocumentMessage = serde_json::from_slice(&queued[0]).unwrap();
    assert_eq!(message.source, "a.pdf");
    server.stop().await;
}

#[tokio::test]
async fn test_reply_to_empty_query() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/rag/reply", server.base))
        .json(&json!({ "query": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["embedding_status"], "No query");
    assert_eq!(body["answer"], NO_DOCUMENTS_RESPONSE);
    server.stop().await;
}

#[tokio::test]
async fn test_completion_failure_is_bad_gateway() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/rag/reply", server.base))
        .json(&json!({ "query": "How long do refunds take?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "completion_error");
    server.stop().await;
}

#[tokio::test]
async fn test_cors_allows_any_origin_by_default() {
    let server = start(Arc::new(DisabledCompletion)).await;
    let resp = reqwest::Client::new()
        .get(format!("{}/health", server.base))
        .header("Origin", "http://localhost:3000")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .and_then(|v| v.to_str().ok()),
        Some("*")
    );
    server.stop().await;
}
