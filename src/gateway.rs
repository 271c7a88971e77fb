//! Embedding + storage of document chunks.
//!
//! The [`EmbeddingGateway`] owns the pairing of one embedder with one vector
//! collection: it makes sure the collection exists with the embedder's
//! dimensionality, and writes every chunk with a vector of exactly that
//! length.

use std::sync::Arc;

use tracing::{debug, info};

use crate::embedding::Embedder;
use crate::error::{PipelineError, PipelineResult};
use crate::models::VectorRecord;
use crate::store::{CollectionSchema, SchemaStatus, VectorStore};

/// Result of [`EmbeddingGateway::embed_and_store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Nothing to store; no embedding or store call was made.
    Skipped,
    Stored(usize),
}

pub struct EmbeddingGateway {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    collection: String,
    batch_size: usize,
}

impl EmbeddingGateway {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            batch_size: batch_size.max(1),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    /// Create the document collection if it does not exist yet.
    ///
    /// A collection that exists with a different vector length is fatal.
    pub async fn ensure_schema(&self) -> PipelineResult<SchemaStatus> {
        ensure_collection(self.store.as_ref(), &self.collection, self.embedder.dims()).await
    }

    /// Embed `chunks` in batches and insert one record per chunk.
    ///
    /// If a failure happens after some records were written, those records
    /// stay and the error is wrapped in [`PipelineError::PartialBatch`].
    pub async fn embed_and_store(&self, chunks: &[String]) -> PipelineResult<StoreOutcome> {
        if chunks.is_empty() {
            debug!(collection = %self.collection, "no chunks to store");
            return Ok(StoreOutcome::Skipped);
        }

        let total = chunks.len();
        let expected = self.embedder.dims();
        let mut stored = 0usize;

        for batch in chunks.chunks(self.batch_size) {
            let vectors = self
                .embedder
                .embed(batch)
                .await
                .map_err(|e| partial(stored, total, PipelineError::Embedding(e)))?;

            if vectors.len() != batch.len() {
                let err = anyhow::anyhow!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
                return Err(partial(stored, total, PipelineError::Embedding(err)));
            }

            for (content, vector) in batch.iter().zip(vectors) {
                if vector.len() != expected {
                    return Err(partial(
                        stored,
                        total,
                        PipelineError::DimensionMismatch {
                            expected,
                            actual: vector.len(),
                        },
                    ));
                }

                let record = VectorRecord::new(&self.collection, content.clone(), vector);
                self.store
                    .insert(&self.collection, &record)
                    .await
                    .map_err(|e| partial(stored, total, PipelineError::Store(e)))?;
                stored += 1;
            }
        }

        info!(
            collection = %self.collection,
            model = self.embedder.model_name(),
            stored,
            "stored chunk embeddings"
        );
        Ok(StoreOutcome::Stored(stored))
    }
}

/// Ensure `name` exists with `dims`-length vectors.
pub async fn ensure_collection(
    store: &dyn VectorStore,
    name: &str,
    dims: usize,
) -> PipelineResult<SchemaStatus> {
    if dims == 0 {
        return Err(PipelineError::Config(
            "embedding provider reports 0 dimensions; configure an embedding provider".into(),
        ));
    }

    let status = store
        .ensure_collection(&CollectionSchema::new(name, dims))
        .await
        .map_err(PipelineError::Store)?;

    match status {
        SchemaStatus::DimensionConflict { existing } => Err(PipelineError::DimensionMismatch {
            expected: dims,
            actual: existing,
        }),
        SchemaStatus::Created => {
            info!(collection = name, dims, backend = store.backend(), "created collection");
            Ok(status)
        }
        SchemaStatus::AlreadyExists => {
            debug!(collection = name, "collection already exists");
            Ok(status)
        }
    }
}

fn partial(stored: usize, total: usize, err: PipelineError) -> PipelineError {
    if stored == 0 {
        return err;
    }
    PipelineError::PartialBatch {
        stored,
        total,
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;

    /// Maps each text to `[len, 1.0]`; fails on the text "boom".
    struct LenEmbedder {
        dims: usize,
    }

    #[async_trait]
    impl Embedder for LenEmbedder {
        fn model_name(&self) -> &str {
            "len"
        }
        fn dims(&self) -> usize {
            self.dims
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t == "boom") {
                anyhow::bail!("provider unavailable");
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn gateway(dims: usize, batch: usize) -> (EmbeddingGateway, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let gw = EmbeddingGateway::new(
            Arc::new(LenEmbedder { dims }),
            store.clone(),
            "DocumentChunk",
            batch,
        );
        (gw, store)
    }

    #[tokio::test]
    async fn test_empty_chunks_skipped() {
        let (gw, store) = gateway(2, 8);
        assert_eq!(gw.embed_and_store(&[]).await.unwrap(), StoreOutcome::Skipped);
        assert_eq!(store.count("DocumentChunk").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stores_one_record_per_chunk() {
        let (gw, store) = gateway(2, 2);
        assert_eq!(gw.ensure_schema().await.unwrap(), SchemaStatus::Created);
        let chunks: Vec<String> = ["a", "bb", "ccc"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            gw.embed_and_store(&chunks).await.unwrap(),
            StoreOutcome::Stored(3)
        );
        assert_eq!(store.contents("DocumentChunk"), vec!["a", "bb", "ccc"]);
    }

    #[tokio::test]
    async fn test_failure_after_first_batch_is_partial() {
        let (gw, store) = gateway(2, 2);
        gw.ensure_schema().await.unwrap();
        let chunks: Vec<String> = ["one", "two", "boom"].iter().map(|s| s.to_string()).collect();

        let err = gw.embed_and_store(&chunks).await.unwrap_err();
        match &err {
            PipelineError::PartialBatch { stored, total, .. } => {
                assert_eq!((*stored, *total), (2, 3));
            }
            other => panic!("expected partial batch, got {other:?}"),
        }
        assert!(!err.is_fatal());
        assert_eq!(store.count("DocumentChunk").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_failure_before_any_store_is_plain() {
        let (gw, _) = gateway(2, 2);
        gw.ensure_schema().await.unwrap();
        let err = gw
            .embed_and_store(&["boom".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_wrong_vector_length_is_fatal() {
        let (gw, _) = gateway(3, 4);
        let err = gw.embed_and_store(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_existing_collection_with_other_dims_is_fatal() {
        let (gw, store) = gateway(2, 4);
        store
            .ensure_collection(&CollectionSchema::new("DocumentChunk", 5))
            .await
            .unwrap();
        let err = gw.ensure_schema().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
