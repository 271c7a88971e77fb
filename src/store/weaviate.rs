//! Weaviate [`VectorStore`] over the v1 REST and GraphQL APIs.
//!
//! Classes are created with `vectorizer: none` and an HNSW index, holding a
//! single `content` text property. Records are written with caller-supplied
//! vectors and searched with GraphQL `nearVector`.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

use crate::models::{RetrievalResult, VectorRecord};

use super::{CollectionSchema, SchemaStatus, VectorStore};

pub struct WeaviateStore {
    base_url: String,
    client: reqwest::Client,
}

impl WeaviateStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn graphql(&self, query: String) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(self.url("/v1/graphql"))
            .json(&json!({ "query": query }))
            .send()
            .await
            .context("Weaviate GraphQL request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Weaviate GraphQL error {}: {}", status, body);
        }

        let json: serde_json::Value = response.json().await?;
        if let Some(errors) = json.get("errors").filter(|e| !e.is_null()) {
            bail!("Weaviate GraphQL returned errors: {}", errors);
        }
        Ok(json)
    }
}

/// Class definition for a collection.
pub fn class_definition(schema: &CollectionSchema) -> serde_json::Value {
    json!({
        "class": schema.name,
        "vectorizer": "none",
        "vectorIndexType": "hnsw",
        "properties": [
            { "name": "content", "dataType": ["text"] }
        ]
    })
}

/// GraphQL `Get` with `nearVector`, returning content and distance.
pub fn near_vector_query(class: &str, vector: &[f32], limit: usize) -> String {
    let vector = vector
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{{ Get {{ {class}(nearVector: {{vector: [{vector}]}}, limit: {limit}) {{ content _additional {{ distance }} }} }} }}"
    )
}

fn parse_near_vector(json: &serde_json::Value, class: &str) -> Result<Vec<RetrievalResult>> {
    let items = json
        .pointer(&format!("/data/Get/{}", class))
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Weaviate response: missing data.Get.{}", class))?;

    items
        .iter()
        .map(|item| {
            let content = item
                .get("content")
                .and_then(|c| c.as_str())
                .unwrap_or_default()
                .to_string();
            let distance = item
                .pointer("/_additional/distance")
                .and_then(|d| d.as_f64())
                .ok_or_else(|| anyhow::anyhow!("Invalid Weaviate response: missing distance"))?
                as f32;
            Ok(RetrievalResult { content, distance })
        })
        .collect()
}

fn is_already_exists(body: &str) -> bool {
    body.contains("already exists")
}

#[async_trait]
impl VectorStore for WeaviateStore {
    fn backend(&self) -> &'static str {
        "weaviate"
    }

    async fn ready(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/v1/.well-known/ready"))
            .send()
            .await
            .context("Weaviate is unreachable")?;
        if !response.status().is_success() {
            bail!("Weaviate is not ready: {}", response.status());
        }
        Ok(())
    }

    async fn ensure_collection(&self, schema: &CollectionSchema) -> Result<SchemaStatus> {
        let existing = self
            .client
            .get(self.url(&format!("/v1/schema/{}", schema.name)))
            .send()
            .await
            .context("Weaviate schema lookup failed")?;

        match existing.status() {
            status if status.is_success() => return Ok(SchemaStatus::AlreadyExists),
            StatusCode::NOT_FOUND => {}
            status => {
                let body = existing.text().await.unwrap_or_default();
                bail!("Weaviate schema lookup error {}: {}", status, body);
            }
        }

        let response = self
            .client
            .post(self.url("/v1/schema"))
            .json(&class_definition(schema))
            .send()
            .await
            .context("Weaviate schema creation failed")?;

        let status = response.status();
        if status.is_success() {
            debug!(class = %schema.name, "created Weaviate class");
            return Ok(SchemaStatus::Created);
        }
        let body = response.text().await.unwrap_or_default();
        // Lost a creation race with another process.
        if status == StatusCode::UNPROCESSABLE_ENTITY && is_already_exists(&body) {
            return Ok(SchemaStatus::AlreadyExists);
        }
        bail!("Weaviate schema creation error {}: {}", status, body)
    }

    async fn insert(&self, collection: &str, record: &VectorRecord) -> Result<()> {
        let body = json!({
            "class": collection,
            "id": record.id,
            "properties": { "content": record.content },
            "vector": record.embedding,
        });
        let response = self
            .client
            .post(self.url("/v1/objects"))
            .json(&body)
            .send()
            .await
            .context("Weaviate object insert failed")?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNPROCESSABLE_ENTITY && is_already_exists(&text) {
            debug!(id = %record.id, "record already stored");
            return Ok(());
        }
        bail!("Weaviate insert error {}: {}", status, text)
    }

    async fn near_vector(
        &self,
        collection: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievalResult>> {
        let json = self
            .graphql(near_vector_query(collection, vector, limit))
            .await?;
        parse_near_vector(&json, collection)
    }

    async fn count(&self, collection: &str) -> Result<usize> {
        let query = format!("{{ Aggregate {{ {collection} {{ meta {{ count }} }} }} }}");
        let json = self.graphql(query).await?;
        json.pointer(&format!("/data/Aggregate/{}/0/meta/count", collection))
            .and_then(|c| c.as_u64())
            .map(|c| c as usize)
            .ok_or_else(|| anyhow::anyhow!("Invalid Weaviate response: missing count"))
    }
}
