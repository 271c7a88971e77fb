//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only surface the pipeline uses to
//! persist and search embedded chunks. Collections (Weaviate "classes") hold
//! records with a single `content` text property and a caller-supplied
//! vector; the store never vectorizes on its own.
//!
//! Backends:
//!
//! | `store.backend` | Type | Notes |
//! |-----------------|------|-------|
//! | `weaviate` | [`weaviate::WeaviateStore`] | REST + GraphQL `nearVector` |
//! | `sqlite` | [`sqlite::SqliteStore`] | brute-force cosine over BLOB vectors |
//! | `memory` | [`memory::MemoryStore`] | process-local, for tests |
//!
//! Implementations must make [`VectorStore::ensure_collection`] safe to call
//! concurrently from several processes: exactly one caller creates the
//! collection and the rest observe [`SchemaStatus::AlreadyExists`].

pub mod memory;
pub mod sqlite;
pub mod weaviate;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::models::{RetrievalResult, VectorRecord};

/// Shape of a collection: one text property, external vectors, HNSW index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: String,
    pub dims: usize,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>, dims: usize) -> Self {
        Self {
            name: name.into(),
            dims,
        }
    }
}

/// Outcome of [`VectorStore::ensure_collection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    Created,
    AlreadyExists,
    /// The collection exists with a different vector length.
    DimensionConflict { existing: usize },
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name for logs (`weaviate`, `sqlite`, `memory`).
    fn backend(&self) -> &'static str;

    /// Readiness probe.
    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    /// Create the collection if it does not exist.
    async fn ensure_collection(&self, schema: &CollectionSchema) -> Result<SchemaStatus>;

    /// Insert one record. Inserting an id that already exists is a no-op.
    async fn insert(&self, collection: &str, record: &VectorRecord) -> Result<()>;

    /// Up to `limit` nearest records by ascending distance.
    async fn near_vector(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalResult>>;

    /// Number of records in the collection.
    async fn count(&self, collection: &str) -> Result<usize>;
}

/// Open the backend selected by `config.backend`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "weaviate" => {
            let url = config.url.as_deref().ok_or_else(|| {
                anyhow::anyhow!("store URL not configured (set [store].url or WEAVIATE_URL)")
            })?;
            let store =
                weaviate::WeaviateStore::new(url, Duration::from_secs(config.timeout_secs))?;
            Ok(Arc::new(store))
        }
        "sqlite" => Ok(Arc::new(sqlite::SqliteStore::open(&config.path).await?)),
        "memory" => Ok(Arc::new(memory::MemoryStore::new())),
        other => bail!("Unknown store backend: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_weaviate_requires_url() {
        let config = StoreConfig::default();
        let err = open_store(&config).await.err().unwrap();
        assert!(err.to_string().contains("WEAVIATE_URL"));
    }

    #[tokio::test]
    async fn test_open_memory_store() {
        let config = StoreConfig {
            backend: "memory".into(),
            ..Default::default()
        };
        let store = open_store(&config).await.unwrap();
        assert_eq!(store.backend(), "memory");
    }
}
