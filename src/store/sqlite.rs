//! SQLite-backed [`VectorStore`].
//!
//! Vectors are stored as little-endian `f32` BLOBs and searched by
//! brute-force cosine distance, which is adequate for local deployments of
//! a few hundred thousand chunks. Collection creation and record inserts use
//! `ON CONFLICT DO NOTHING`, so concurrent processes converge on the same
//! state without coordination.

use std::path::Path;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::db;
use crate::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use crate::migrate;
use crate::models::{RetrievalResult, VectorRecord};

use super::{CollectionSchema, SchemaStatus, VectorStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database at `path` and apply migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn ready(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn ensure_collection(&self, schema: &CollectionSchema) -> Result<SchemaStatus> {
        let now = chrono::Utc::now().timestamp();
        let inserted = sqlx::query(
            r#"
            INSERT INTO collections (name, dims, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&schema.name)
        .bind(schema.dims as i64)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(SchemaStatus::Created);
        }

        let existing: i64 = sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
            .bind(&schema.name)
            .fetch_one(&self.pool)
            .await?;
        if existing as usize != schema.dims {
            return Ok(SchemaStatus::DimensionConflict {
                existing: existing as usize,
            });
        }
        Ok(SchemaStatus::AlreadyExists)
    }

    async fn insert(&self, collection: &str, record: &VectorRecord) -> Result<()> {
        let dims: Option<i64> = sqlx::query_scalar("SELECT dims FROM collections WHERE name = ?")
            .bind(collection)
            .fetch_optional(&self.pool)
            .await?;
        match dims {
            None => bail!("collection '{}' does not exist", collection),
            Some(d) if d as usize != record.embedding.len() => bail!(
                "vector length {} does not match collection '{}' ({} dims)",
                record.embedding.len(),
                collection,
                d
            ),
            Some(_) => {}
        }

        sqlx::query(
            r#"
            INSERT INTO vector_records (id, collection, content, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&record.id)
        .bind(collection)
        .bind(&record.content)
        .bind(vec_to_blob(&record.embedding))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn near_vector(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let rows = sqlx::query("SELECT content, embedding FROM vector_records WHERE collection = ?")
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;

        let mut results: Vec<RetrievalResult> = rows
            .iter()
            .map(|row| {
                let content: String = row.get("content");
                let blob: Vec<u8> = row.get("embedding");
                RetrievalResult {
                    content,
                    distance: cosine_distance(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();
        results.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        results.truncate(limit);
        Ok(results)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE collection = ?")
                .bind(collection)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }
}
