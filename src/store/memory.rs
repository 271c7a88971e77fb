//! In-memory [`VectorStore`] for tests and single-process use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Vector search is
//! brute-force cosine distance over every record in the collection.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_distance;
use crate::models::{RetrievalResult, VectorRecord};

use super::{CollectionSchema, SchemaStatus, VectorStore};

struct Collection {
    dims: usize,
    ids: HashSet<String>,
    records: Vec<VectorRecord>,
}

pub struct MemoryStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Collection>> {
        self.collections
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Collection>> {
        self.collections
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Contents of every record in insertion order.
    pub fn contents(&self, collection: &str) -> Vec<String> {
        self.read()
            .get(collection)
            .map(|c| c.records.iter().map(|r| r.content.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_collection(&self, schema: &CollectionSchema) -> Result<SchemaStatus> {
        let mut collections = self.write();
        match collections.get(&schema.name) {
            Some(existing) if existing.dims != schema.dims => Ok(SchemaStatus::DimensionConflict {
                existing: existing.dims,
            }),
            Some(_) => Ok(SchemaStatus::AlreadyExists),
            None => {
                collections.insert(
                    schema.name.clone(),
                    Collection {
                        dims: schema.dims,
                        ids: HashSet::new(),
                        records: Vec::new(),
                    },
                );
                Ok(SchemaStatus::Created)
            }
        }
    }

    async fn insert(&self, collection: &str, record: &VectorRecord) -> Result<()> {
        let mut collections = self.write();
        let target = match collections.get_mut(collection) {
            Some(c) => c,
            None => bail!("collection '{}' does not exist", collection),
        };
        if record.embedding.len() != target.dims {
            bail!(
                "vector length {} does not match collection '{}' ({} dims)",
                record.embedding.len(),
                collection,
                target.dims
            );
        }
        if target.ids.insert(record.id.clone()) {
            target.records.push(record.clone());
        }
        Ok(())
    }

    async fn near_vector(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let collections = self.read();
        let target = match collections.get(collection) {
            Some(c) => c,
            None => bail!("collection '{}' does not exist", collection),
        };

        let mut results: Vec<RetrievalResult> = target
            .records
            .iter()
            .map(|r| RetrievalResult {
                content: r.content.clone(),
                distance: cosine_distance(vector, &r.embedding),
            })
            .collect();
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(limit);
        Ok(results)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.read().get(collection).map_or(0, |c| c.records.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content: &str, embedding: Vec<f32>) -> VectorRecord {
        VectorRecord::new("Docs", content.to_string(), embedding)
    }

    #[tokio::test]
    async fn test_ensure_collection_statuses() {
        let store = MemoryStore::new();
        let schema = CollectionSchema::new("Docs", 3);
        assert_eq!(store.ensure_collection(&schema).await.unwrap(), SchemaStatus::Created);
        assert_eq!(
            store.ensure_collection(&schema).await.unwrap(),
            SchemaStatus::AlreadyExists
        );
        assert_eq!(
            store
                .ensure_collection(&CollectionSchema::new("Docs", 4))
                .await
                .unwrap(),
            SchemaStatus::DimensionConflict { existing: 3 }
        );
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_by_id() {
        let store = MemoryStore::new();
        store
            .ensure_collection(&CollectionSchema::new("Docs", 2))
            .await
            .unwrap();
        let r = record("hello", vec![1.0, 0.0]);
        store.insert("Docs", &r).await.unwrap();
        store.insert("Docs", &r).await.unwrap();
        assert_eq!(store.count("Docs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_missing_collection_and_wrong_dims() {
        let store = MemoryStore::new();
        assert!(store.insert("Docs", &record("x", vec![1.0])).await.is_err());

        store
            .ensure_collection(&CollectionSchema::new("Docs", 2))
            .await
            .unwrap();
        assert!(store.insert("Docs", &record("x", vec![1.0])).await.is_err());
    }

    #[tokio::test]
    async fn test_near_vector_orders_by_distance() {
        let store = MemoryStore::new();
        store
            .ensure_collection(&CollectionSchema::new("Docs", 2))
            .await
            .unwrap();
        store.insert("Docs", &record("far", vec![-1.0, 0.0])).await.unwrap();
        store.insert("Docs", &record("near", vec![1.0, 0.1])).await.unwrap();
        store.insert("Docs", &record("mid", vec![0.0, 1.0])).await.unwrap();

        let hits = store.near_vector("Docs", &[1.0, 0.0], 2).await.unwrap();
        let contents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        assert_eq!(contents, vec!["near", "mid"]);
        assert!(hits[0].distance <= hits[1].distance);
    }
}
