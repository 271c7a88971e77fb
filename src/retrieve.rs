//! Query embedding and nearest-neighbor retrieval.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::embedding::{embed_query, Embedder};
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::ensure_collection;
use crate::models::{RetrievalResult, VectorRecord};
use crate::store::VectorStore;

/// Outcome of embedding a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryEmbedding {
    /// The query was empty or whitespace; nothing was embedded.
    NoQuery,
    Vector(Vec<f32>),
}

/// Human-readable status reported alongside an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingStatus {
    NoQuery,
    Embedded,
    /// Embedded and recorded in the named query collection.
    Recorded(String),
    /// Embedded, but recording it in the query collection failed.
    RecordFailed(String),
    Failed(String),
}

impl fmt::Display for EmbeddingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmbeddingStatus::NoQuery => write!(f, "No query"),
            EmbeddingStatus::Embedded => write!(f, "Query embedded"),
            EmbeddingStatus::Recorded(class) => {
                write!(f, "Query embedded and added to {}", class)
            }
            EmbeddingStatus::RecordFailed(reason) => {
                write!(f, "Query embedded; recording failed: {}", reason)
            }
            EmbeddingStatus::Failed(reason) => write!(f, "Embedding failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Retrieval {
    pub status: EmbeddingStatus,
    pub results: Vec<RetrievalResult>,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    collection: String,
    query_collection: Option<String>,
    top_k: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        top_k: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            query_collection: None,
            top_k: top_k.max(1),
        }
    }

    /// Also store each embedded query in `collection`.
    pub fn record_queries(mut self, collection: impl Into<String>) -> Self {
        self.query_collection = Some(collection.into());
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Create the query collection when query recording is enabled.
    pub async fn ensure_query_collection(&self) -> PipelineResult<()> {
        if let Some(class) = &self.query_collection {
            ensure_collection(self.store.as_ref(), class, self.embedder.dims()).await?;
        }
        Ok(())
    }

    pub async fn embed_query(&self, query: &str) -> PipelineResult<QueryEmbedding> {
        if query.trim().is_empty() {
            return Ok(QueryEmbedding::NoQuery);
        }
        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .map_err(PipelineError::Embedding)?;
        Ok(QueryEmbedding::Vector(vector))
    }

    /// Up to `k` nearest chunks, closest first. Store failures yield `[]`.
    pub async fn search(&self, vector: &[f32], k: usize) -> Vec<RetrievalResult> {
        match self.store.near_vector(&self.collection, vector, k).await {
            Ok(mut results) => {
                results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
                results.truncate(k);
                results
            }
            Err(e) => {
                warn!(collection = %self.collection, error = %e, "vector search failed; answering without context");
                Vec::new()
            }
        }
    }

    /// Embed `query` and search with the configured `top_k`. Never fails:
    /// problems are reported through the status and an empty result set.
    pub async fn retrieve(&self, query: &str) -> Retrieval {
        let vector = match self.embed_query(query).await {
            Ok(QueryEmbedding::NoQuery) => {
                debug!("empty query; skipping retrieval");
                return Retrieval {
                    status: EmbeddingStatus::NoQuery,
                    results: Vec::new(),
                };
            }
            Ok(QueryEmbedding::Vector(v)) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return Retrieval {
                    status: EmbeddingStatus::Failed(e.to_string()),
                    results: Vec::new(),
                };
            }
        };

        let status = match &self.query_collection {
            Some(class) => {
                let record = VectorRecord::new(class, query.to_string(), vector.clone());
                match self.store.insert(class, &record).await {
                    Ok(()) => EmbeddingStatus::Recorded(class.clone()),
                    Err(e) => {
                        warn!(collection = %class, error = %e, "failed to record query");
                        EmbeddingStatus::RecordFailed(e.to_string())
                    }
                }
            }
            None => EmbeddingStatus::Embedded,
        };

        let results = self.search(&vector, self.top_k).await;
        info!(results = results.len(), "retrieved context");
        Retrieval { status, results }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::CollectionSchema;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct AxisEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for AxisEmbedder {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| if t.contains("refund") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
                .collect())
        }
    }

    async fn setup() -> (Retriever, Arc<AxisEmbedder>, Arc<MemoryStore>) {
        let embedder = Arc::new(AxisEmbedder {
            calls: AtomicUsize::new(0),
        });
        let store = Arc::new(MemoryStore::new());
        store
            .ensure_collection(&CollectionSchema::new("DocumentChunk", 2))
            .await
            .unwrap();
        let retriever = Retriever::new(embedder.clone(), store.clone(), "DocumentChunk", 3);
        (retriever, embedder, store)
    }

    #[tokio::test]
    async fn test_empty_query_touches_nothing() {
        let (retriever, embedder, _) = setup().await;
        assert_eq!(retriever.embed_query("   ").await.unwrap(), QueryEmbedding::NoQuery);

        let retrieval = retriever.retrieve("").await;
        assert_eq!(retrieval.status, EmbeddingStatus::NoQuery);
        assert_eq!(retrieval.status.to_string(), "No query");
        assert!(retrieval.results.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_missing_collection_degrades_to_empty() {
        let (retriever, _, _) = setup().await;
        let other = Retriever::new(
            Arc::new(AxisEmbedder {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(MemoryStore::new()),
            "Missing",
            3,
        );
        assert!(other.search(&[1.0, 0.0], 3).await.is_empty());
        assert!(retriever.search(&[1.0, 0.0], 3).await.is_empty());
    }

    #[tokio::test]
    async fn test_record_queries_status() {
        let (retriever, _, store) = setup().await;
        let retriever = retriever.record_queries("QueryVector");
        retriever.ensure_query_collection().await.unwrap();

        let retrieval = retriever.retrieve("what is the refund policy").await;
        assert_eq!(
            retrieval.status.to_string(),
            "Query embedded and added to QueryVector"
        );
        assert_eq!(store.count("QueryVector").await.unwrap(), 1);
    }
}
