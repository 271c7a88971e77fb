//! Durable broker topology shared by publishers and consumers.
//!
//! ```text
//!   publisher ──► rag_queue ──(TTL / reject)──┐
//!   publisher ──► user_message_queue ──(…)────┤
//!                                             ▼
//!                                    dlx (fanout) ──► dlq
//! ```
//!
//! Every declaration is idempotent, so all processes run
//! [`ensure_topology`] before publishing or consuming. A queue that already
//! exists with different arguments is a configuration error.

use tracing::info;

use crate::broker::{Broker, ExchangeKind, QueueSpec};
use crate::error::{PipelineError, PipelineResult};

/// Names and policy of the declared topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub ingest_queues: Vec<String>,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub message_ttl_ms: u32,
}

impl TopologyConfig {
    /// Queue spec for an ingest queue under this policy.
    pub fn ingest_queue(&self, name: &str) -> QueueSpec {
        QueueSpec::durable(name)
            .with_ttl(self.message_ttl_ms)
            .with_dead_letter(self.dead_letter_exchange.as_str())
    }
}

/// Declare the dead-letter exchange and queue, bind them, then declare each
/// ingest queue with TTL and dead-letter routing.
pub async fn ensure_topology(broker: &dyn Broker, config: &TopologyConfig) -> PipelineResult<()> {
    broker
        .declare_exchange(&config.dead_letter_exchange, ExchangeKind::Fanout)
        .await
        .map_err(PipelineError::Topology)?;
    broker
        .declare_queue(&QueueSpec::durable(config.dead_letter_queue.as_str()))
        .await
        .map_err(PipelineError::Topology)?;
    broker
        .bind_queue(&config.dead_letter_queue, &config.dead_letter_exchange)
        .await
        .map_err(PipelineError::Topology)?;

    for queue in &config.ingest_queues {
        broker
            .declare_queue(&config.ingest_queue(queue))
            .await
            .map_err(PipelineError::Topology)?;
    }

    info!(
        queues = ?config.ingest_queues,
        dlx = %config.dead_letter_exchange,
        dlq = %config.dead_letter_queue,
        ttl_ms = config.message_ttl_ms,
        "broker topology ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBus;

    fn topology() -> TopologyConfig {
        TopologyConfig {
            ingest_queues: vec!["rag_queue".into(), "user_message_queue".into()],
            dead_letter_exchange: "dlx".into(),
            dead_letter_queue: "dlq".into(),
            message_ttl_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_declares_expected_topology() {
        let bus = MemoryBus::new();
        ensure_topology(&bus.handle(), &topology()).await.unwrap();

        assert_eq!(bus.exchange_kind("dlx"), Some(ExchangeKind::Fanout));
        assert_eq!(bus.bindings("dlx"), vec!["dlq".to_string()]);

        let dlq = bus.queue_spec("dlq").unwrap();
        assert!(dlq.durable);
        assert_eq!(dlq.message_ttl_ms, None);

        for name in ["rag_queue", "user_message_queue"] {
            let spec = bus.queue_spec(name).unwrap();
            assert!(spec.durable);
            assert_eq!(spec.message_ttl_ms, Some(60_000));
            assert_eq!(spec.dead_letter_exchange.as_deref(), Some("dlx"));
        }
    }

    #[tokio::test]
    async fn test_repeat_is_idempotent() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        ensure_topology(&broker, &topology()).await.unwrap();
        ensure_topology(&broker, &topology()).await.unwrap();
        assert_eq!(bus.bindings("dlx").len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_queue_is_fatal() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        broker
            .declare_queue(&QueueSpec::durable("rag_queue"))
            .await
            .unwrap();

        let err = ensure_topology(&broker, &topology()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Topology(_)));
        assert!(err.is_fatal());
    }
}
