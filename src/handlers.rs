//! Handlers for the two ingest queues.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::chunk::{clean_text, TextChunker};
use crate::consumer::MessageHandler;
use crate::error::PipelineResult;
use crate::gateway::{EmbeddingGateway, StoreOutcome};
use crate::models::{DocumentMessage, UserMessage};

/// Number of chunks previewed at debug level per document.
const PREVIEW_CHUNKS: usize = 2;

/// `rag_queue`: clean → chunk → embed and store.
pub struct DocumentHandler {
    chunker: TextChunker,
    gateway: Arc<EmbeddingGateway>,
}

impl DocumentHandler {
    pub fn new(chunker: TextChunker, gateway: Arc<EmbeddingGateway>) -> Self {
        Self { chunker, gateway }
    }
}

#[async_trait]
impl MessageHandler for DocumentHandler {
    fn name(&self) -> &str {
        "documents"
    }

    fn requires_schema(&self) -> bool {
        true
    }

    async fn prepare(&self) -> PipelineResult<()> {
        self.gateway.ensure_schema().await?;
        Ok(())
    }

    async fn handle(&self, body: &[u8]) -> PipelineResult<()> {
        let message: DocumentMessage = serde_json::from_slice(body)?;
        let cleaned = clean_text(&message.text);
        let chunks = self.chunker.chunk(&cleaned);
        info!(source = %message.source, chunks = chunks.len(), "chunked document");

        for (i, chunk) in chunks.iter().take(PREVIEW_CHUNKS).enumerate() {
            debug!(source = %message.source, index = i + 1, chunk = %chunk, "chunk preview");
        }

        match self.gateway.embed_and_store(&chunks).await? {
            StoreOutcome::Skipped => {
                info!(source = %message.source, "document had no text; nothing stored")
            }
            StoreOutcome::Stored(n) => info!(source = %message.source, stored = n, "document stored"),
        }
        Ok(())
    }
}

/// `user_message_queue`: decode and log.
pub struct UserMessageHandler;

#[async_trait]
impl MessageHandler for UserMessageHandler {
    fn name(&self) -> &str {
        "user-messages"
    }

    async fn handle(&self, body: &[u8]) -> PipelineResult<()> {
        let message: UserMessage = serde_json::from_slice(body)?;
        info!(
            user_id = %message.user_id,
            timestamp = message.timestamp.as_deref().unwrap_or("-"),
            text = %message.text,
            "received user message"
        );
        Ok(())
    }
}
