//! Message broker abstraction.
//!
//! The [`Broker`] trait covers exactly the AMQP surface the pipeline needs:
//! durable declarations, persistent confirmed publishes to the default
//! exchange, and manual-ack subscriptions. Two backends implement it:
//!
//! - [`amqp`]: RabbitMQ via `lapin` (publisher confirms, prefetch 1).
//! - [`memory`]: an in-process broker with TTL expiry and dead-letter
//!   routing, used by tests and embedders of the library.
//!
//! Connections are produced by a [`Connector`] so that owners (publisher,
//! consumer runtime) can establish them lazily and reconnect explicitly.

pub mod amqp;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Errors raised by broker backends.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("connection is closed")]
    Closed,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("publish to '{0}' was not confirmed by the broker")]
    Nacked(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("could not serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl BrokerError {
    /// True when the connection (not the request) is the problem, so a
    /// fresh connection may succeed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Fanout,
    Direct,
}

/// Declaration of a durable queue and its expiry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub message_ttl_ms: Option<u32>,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl_ms: None,
            dead_letter_exchange: None,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u32) -> Self {
        self.message_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }
}

/// Settles a single delivery. Exactly one of `ack`/`reject` is called.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;
    /// Reject without requeue; the queue's dead-letter policy applies.
    async fn reject(&self) -> Result<(), BrokerError>;
}

/// A message handed to a subscriber, awaiting settlement.
pub struct Delivery {
    body: Vec<u8>,
    redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.reject().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one subscription. Ends when the connection closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// An open broker connection.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a queue. Re-declaring with identical arguments is a no-op;
    /// different arguments fail with [`BrokerError::PreconditionFailed`].
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;

    /// Publish a persistent message to `queue` through the default exchange.
    /// Returns once the broker has confirmed the enqueue.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Start a manual-ack subscription that receives one unsettled delivery
    /// at a time.
    async fn subscribe(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, BrokerError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Opens broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}
