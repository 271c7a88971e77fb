//! Prompt composition and answer generation.

use tracing::{debug, info};

use crate::completion::{CompletionRequest, CompletionService};
use crate::config::CompletionConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::RetrievalResult;

pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";
pub const NO_QUERY_RESPONSE: &str = "Please provide a valid query.";
pub const NO_DOCUMENTS_RESPONSE: &str = "No relevant documents found to answer the question.";

/// Build the completion prompt from a question and pre-joined context.
pub fn compose_prompt(query: &str, context: &str) -> String {
    format!(
        "You are an AI assistant. Use the following context to answer the question below. \
         If the context does not contain the answer, respond accordingly.\n\n\
         Context:\n{context}\n\n\
         Question:\n{query}\n\n\
         Answer:"
    )
}

/// Join document contents in rank order, stopping before `max_chars` is
/// exceeded. The first document is truncated rather than dropped.
pub fn join_context(docs: &[RetrievalResult], max_chars: usize) -> String {
    let separator_len = CONTEXT_SEPARATOR.chars().count();
    let mut context = String::new();
    let mut used = 0usize;

    for (i, doc) in docs.iter().enumerate() {
        let len = doc.content.chars().count();
        if i == 0 {
            if len > max_chars {
                context.extend(doc.content.chars().take(max_chars));
                break;
            }
            context.push_str(&doc.content);
            used = len;
            continue;
        }
        if used + separator_len + len > max_chars {
            break;
        }
        context.push_str(CONTEXT_SEPARATOR);
        context.push_str(&doc.content);
        used += separator_len + len;
    }

    context
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    model: String,
    max_tokens: u32,
    temperature: f32,
    max_context_chars: usize,
}

impl PromptComposer {
    pub fn from_config(config: &CompletionConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_context_chars: config.max_context_chars.max(1),
        }
    }

    pub fn compose(&self, query: &str, docs: &[RetrievalResult]) -> String {
        compose_prompt(query, &join_context(docs, self.max_context_chars))
    }

    pub fn request(&self, query: &str, docs: &[RetrievalResult]) -> CompletionRequest {
        CompletionRequest {
            prompt: self.compose(query, docs),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Answer `query` from `docs`. Without documents the completion service
    /// is not called and a fixed response is returned.
    pub async fn answer(
        &self,
        query: &str,
        docs: &[RetrievalResult],
        completion: &dyn CompletionService,
    ) -> PipelineResult<String> {
        if docs.is_empty() {
            debug!("no context documents; returning fixed response");
            return Ok(NO_DOCUMENTS_RESPONSE.to_string());
        }
        if query.trim().is_empty() {
            return Ok(NO_QUERY_RESPONSE.to_string());
        }

        let request = self.request(query, docs);
        info!(model = %request.model, documents = docs.len(), "requesting completion");
        completion
            .complete(&request)
            .await
            .map_err(PipelineError::Completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn doc(content: &str, distance: f32) -> RetrievalResult {
        RetrievalResult {
            content: content.to_string(),
            distance,
        }
    }

    #[derive(Default)]
    struct Recording {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionService for Recording {
        async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            Ok("answer".to_string())
        }
    }

    #[test]
    fn test_prompt_layout() {
        let prompt = compose_prompt("Q?", "ctx");
        assert!(prompt.starts_with("You are an AI assistant."));
        assert!(prompt.contains("If the context does not contain the answer, respond accordingly."));
        assert!(prompt.contains("Context:\nctx\n\nQuestion:\nQ?\n\nAnswer:"));
        assert!(prompt.ends_with("Answer:"));
    }

    #[test]
    fn test_join_context_uses_separator_and_budget() {
        let docs = vec![doc("aaaa", 0.1), doc("bbbb", 0.2), doc("cccc", 0.3)];
        assert_eq!(join_context(&docs, 1000), "aaaa\n\n---\n\nbbbb\n\n---\n\ncccc");

        // 4 + 7 + 4 = 15 fits, the third does not.
        assert_eq!(join_context(&docs, 20), "aaaa\n\n---\n\nbbbb");
        assert_eq!(join_context(&docs, 2), "aa");
    }

    #[tokio::test]
    async fn test_no_documents_skips_completion() {
        let composer = PromptComposer::from_config(&CompletionConfig::default());
        let service = Recording::default();
        let answer = composer.answer("anything", &[], &service).await.unwrap();
        assert_eq!(answer, NO_DOCUMENTS_RESPONSE);
        assert!(service.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_with_documents() {
        let composer = PromptComposer::from_config(&CompletionConfig::default());
        let service = Recording::default();
        let answer = composer
            .answer(" ", &[doc("x", 0.1)], &service)
            .await
            .unwrap();
        assert_eq!(answer, NO_QUERY_RESPONSE);
        assert!(service.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_parameters() {
        let composer = PromptComposer::from_config(&CompletionConfig::default());
        let service = Recording::default();
        composer
            .answer("refund policy?", &[doc("Refunds within 14 days.", 0.1)], &service)
            .await
            .unwrap();

        let requests = service.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-3.5-turbo");
        assert_eq!(requests[0].max_tokens, 512);
        assert!((requests[0].temperature - 0.7).abs() < f32::EPSILON);
        assert!(requests[0].prompt.contains("Refunds within 14 days."));
    }
}
