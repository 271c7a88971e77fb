//! Error taxonomy for the ingestion and retrieval pipeline.
//!
//! Components return [`PipelineError`]. The consumer runtime is the single
//! place that turns an error into an acknowledgment decision, and it does so
//! through [`PipelineError::class`]:
//!
//! | Class | Consumer behavior |
//! |-------|-------------------|
//! | [`ErrorClass::Configuration`] | reject the delivery, then stop the runtime |
//! | [`ErrorClass::Transient`] | reject without requeue (TTL → dead-letter) |
//! | [`ErrorClass::Validation`] | reject without requeue |
//! | [`ErrorClass::PartialBatch`] | reject without requeue; stored prefix stays |
//!
//! Benign empty cases (empty query, empty chunk list) are never errors; they
//! are modelled as explicit result variants by the components themselves.

use crate::broker::BrokerError;

/// Broad category of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Transient,
    Validation,
    PartialBatch,
}

/// Top-level error type for pipeline components.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("embedding dimension mismatch: expected {expected} dims, found {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("broker topology could not be declared: {0}")]
    Topology(#[source] BrokerError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("vector store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("embedding error: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("completion service error: {0}")]
    Completion(#[source] anyhow::Error),

    #[error("could not decode message body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("consumer worker for '{0}' terminated abnormally")]
    Worker(String),

    #[error("stored {stored} of {total} records before failing: {source}")]
    PartialBatch {
        stored: usize,
        total: usize,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Classify the error for the acknowledgment decision.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Config(_)
            | PipelineError::DimensionMismatch { .. }
            | PipelineError::Topology(_)
            | PipelineError::Worker(_) => ErrorClass::Configuration,
            PipelineError::Decode(_) => ErrorClass::Validation,
            PipelineError::PartialBatch { source, .. } => match source.class() {
                ErrorClass::Configuration => ErrorClass::Configuration,
                _ => ErrorClass::PartialBatch,
            },
            PipelineError::Broker(_)
            | PipelineError::Store(_)
            | PipelineError::Embedding(_)
            | PipelineError::Completion(_) => ErrorClass::Transient,
        }
    }

    /// Whether the owning process must stop rather than keep consuming.
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
