//! Query → retrieval → prompt → answer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::completion::CompletionService;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::PipelineResult;
use crate::prompt::PromptComposer;
use crate::retrieve::Retriever;
use crate::store::VectorStore;

/// Response shape of the retrieval query boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagReply {
    pub embedding_status: String,
    pub answer: String,
}

pub struct RagService {
    retriever: Retriever,
    composer: PromptComposer,
    completion: Arc<dyn CompletionService>,
}

impl RagService {
    pub fn new(
        retriever: Retriever,
        composer: PromptComposer,
        completion: Arc<dyn CompletionService>,
    ) -> Self {
        Self {
            retriever,
            composer,
            completion,
        }
    }

    /// Wire a service from configuration around shared clients, creating the
    /// query collection when query recording is enabled.
    pub async fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        completion: Arc<dyn CompletionService>,
    ) -> PipelineResult<Self> {
        let mut retriever = Retriever::new(
            embedder,
            store,
            config.store.document_class.as_str(),
            config.retrieval.top_k,
        );
        if config.retrieval.record_queries {
            retriever = retriever.record_queries(config.store.query_class.as_str());
            retriever.ensure_query_collection().await?;
        }
        Ok(Self::new(
            retriever,
            PromptComposer::from_config(&config.completion),
            completion,
        ))
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Answer `query`. Only a failing completion call is an error; empty
    /// queries and empty retrievals yield fixed answers.
    pub async fn reply(&self, query: &str) -> PipelineResult<RagReply> {
        let retrieval = self.retriever.retrieve(query).await;
        info!(
            status = %retrieval.status,
            documents = retrieval.results.len(),
            "answering query"
        );
        let answer = self
            .composer
            .answer(query, &retrieval.results, self.completion.as_ref())
            .await?;

        Ok(RagReply {
            embedding_status: retrieval.status.to_string(),
            answer,
        })
    }
}
