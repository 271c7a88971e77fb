//! Core data models used throughout the pipeline.
//!
//! These types represent the message envelopes that travel through the
//! broker and the records and results that flow through the vector store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A document to ingest, published to the document queue.
///
/// Produced by the text-extraction boundary (or `ragline publish document`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMessage {
    pub text: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// A chat message from a user, published to the user-message queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub text: String,
    pub user_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl DocumentMessage {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            timestamp: Some(now_iso()),
        }
    }
}

impl UserMessage {
    pub fn new(text: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: user_id.into(),
            timestamp: Some(now_iso()),
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// A chunk plus its embedding, as persisted in a vector collection.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Deterministic UUID derived from the collection and content.
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

impl VectorRecord {
    /// Build a record whose id is stable across redeliveries of the same
    /// content into the same collection.
    pub fn new(collection: &str, content: String, embedding: Vec<f32>) -> Self {
        Self {
            id: record_id(collection, &content),
            content,
            embedding,
        }
    }
}

/// UUID-shaped id from SHA-256(collection, content).
pub fn record_id(collection: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string()
}

/// A nearest-neighbor hit. Lower distance means more similar.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalResult {
    pub content: String,
    pub distance: f32,
}
