//! Consumer runtime: connect, declare, subscribe, and settle deliveries.
//!
//! # Lifecycle
//!
//! Each subscription moves through [`SubscriptionState`]:
//!
//! ```text
//! Disconnected → Connected → SchemaReady → Consuming → Draining → Closed
//! ```
//!
//! (`SchemaReady` is skipped by handlers without preparation.) States are
//! published on a `tokio::sync::watch` channel per queue.
//!
//! Schema bootstrap runs for every handler that needs it before any worker
//! is spawned, so a configuration error stops the runtime before a single
//! delivery is pulled. A subscription turns `Draining` the moment shutdown
//! is requested, including while a handler is still running.
//!
//! # Acknowledgment
//!
//! The runtime is the only place that decides ack or reject:
//!
//! - handler `Ok` → ack
//! - handler `Err` → reject without requeue (the queue's TTL and
//!   dead-letter policy take over)
//! - configuration-class error → reject, then stop every worker and return
//!   the error from [`ConsumerRuntime::run`]
//! - shutdown grace elapsed mid-handler → the handler is dropped and the
//!   delivery rejected
//!
//! Each queue has one worker task; a worker settles delivery N before it
//! pulls delivery N+1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Connector, Delivery};
use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::topology::{ensure_topology, TopologyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connected,
    SchemaReady,
    Consuming,
    Draining,
    Closed,
}

/// Processes the bodies of one queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Whether [`prepare`](MessageHandler::prepare) must run before consuming.
    fn requires_schema(&self) -> bool {
        false
    }

    /// One-time setup before the first delivery.
    async fn prepare(&self) -> PipelineResult<()> {
        Ok(())
    }

    async fn handle(&self, body: &[u8]) -> PipelineResult<()>;
}

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub shutdown_grace: Duration,
    pub topology: TopologyConfig,
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_attempts: config.consumer.connect_attempts.max(1),
            connect_backoff: Duration::from_millis(config.consumer.connect_backoff_ms),
            shutdown_grace: Duration::from_secs(config.consumer.shutdown_grace_secs),
            topology: config.broker.topology(),
        }
    }
}

/// Settlement counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub acked: u64,
    pub rejected: u64,
}

struct Subscription {
    queue: String,
    handler: Arc<dyn MessageHandler>,
    state: watch::Sender<SubscriptionState>,
}

pub struct ConsumerRuntime {
    connector: Arc<dyn Connector>,
    options: RuntimeOptions,
    subscriptions: Vec<Subscription>,
}

impl ConsumerRuntime {
    pub fn new(connector: Arc<dyn Connector>, options: RuntimeOptions) -> Self {
        Self {
            connector,
            options,
            subscriptions: Vec::new(),
        }
    }

    /// Register `handler` for `queue`.
    pub fn subscribe(mut self, queue: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Disconnected);
        self.subscriptions.push(Subscription {
            queue: queue.into(),
            handler,
            state,
        });
        self
    }

    /// Observe the state of the subscription on `queue`.
    pub fn state(&self, queue: &str) -> Option<watch::Receiver<SubscriptionState>> {
        self.subscriptions
            .iter()
            .find(|s| s.queue == queue)
            .map(|s| s.state.subscribe())
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    pub async fn run(
        self,
        shutdown: CancellationToken,
    ) -> PipelineResult<HashMap<String, QueueStats>> {
        let broker = self.connect().await?;
        for sub in &self.subscriptions {
            sub.state.send_replace(SubscriptionState::Connected);
        }

        if let Err(e) = ensure_topology(broker.as_ref(), &self.options.topology).await {
            self.close(broker.as_ref()).await;
            return Err(e);
        }

        // Every schema must be in place before any queue starts consuming.
        for sub in &self.subscriptions {
            if !sub.handler.requires_schema() {
                continue;
            }
            if let Err(e) = sub.handler.prepare().await {
                error!(queue = %sub.queue, handler = sub.handler.name(), error = %e, "schema bootstrap failed");
                self.close(broker.as_ref()).await;
                return Err(e);
            }
            sub.state.send_replace(SubscriptionState::SchemaReady);
        }

        let stop = shutdown.child_token();
        let mut workers = Vec::with_capacity(self.subscriptions.len());
        for sub in &self.subscriptions {
            let worker = Worker {
                broker: broker.clone(),
                queue: sub.queue.clone(),
                handler: sub.handler.clone(),
                state: sub.state.clone(),
                stop: stop.clone(),
                grace: self.options.shutdown_grace,
            };
            let queue = sub.queue.clone();
            workers.push((queue, tokio::spawn(worker.run())));
        }

        let mut stats = HashMap::new();
        let mut failure = None;
        for (queue, handle) in workers {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(queue = %queue, error = %join_err, "consumer worker panicked");
                    Err(PipelineError::Worker(queue.clone()))
                }
            };
            match outcome {
                Ok(queue_stats) => {
                    stats.insert(queue, queue_stats);
                }
                Err(e) => {
                    stop.cancel();
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        self.close(broker.as_ref()).await;

        match failure {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    async fn connect(&self) -> PipelineResult<Arc<dyn Broker>> {
        let attempts = self.options.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect().await {
                Ok(broker) => {
                    info!(attempt, "connected to broker");
                    return Ok(broker);
                }
                Err(e) if attempt < attempts => {
                    let delay = self.options.connect_backoff * attempt;
                    warn!(attempt, attempts, error = %e, ?delay, "broker connection failed; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(attempts, error = %e, "giving up connecting to broker");
                    return Err(e.into());
                }
            }
        }
    }

    async fn close(&self, broker: &dyn Broker) {
        if let Err(e) = broker.close().await {
            warn!(error = %e, "error closing broker connection");
        }
        for sub in &self.subscriptions {
            sub.state.send_replace(SubscriptionState::Closed);
        }
        info!("consumer runtime closed");
    }
}

struct Worker {
    broker: Arc<dyn Broker>,
    queue: String,
    handler: Arc<dyn MessageHandler>,
    state: watch::Sender<SubscriptionState>,
    stop: CancellationToken,
    grace: Duration,
}

impl Worker {
    async fn run(self) -> PipelineResult<QueueStats> {
        let result = self.consume().await;
        self.state.send_replace(SubscriptionState::Draining);
        if let Err(e) = &result {
            error!(queue = %self.queue, handler = self.handler.name(), error = %e, "consumer stopped");
            self.stop.cancel();
        }
        result
    }

    async fn consume(&self) -> PipelineResult<QueueStats> {
        let mut stats = QueueStats::default();

        let tag = format!("ragline-{}", self.handler.name());
        let mut deliveries = self.broker.subscribe(&self.queue, &tag).await?;
        self.state.send_replace(SubscriptionState::Consuming);
        info!(queue = %self.queue, handler = self.handler.name(), "consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.state.send_replace(SubscriptionState::Draining);
                    debug!(queue = %self.queue, "shutdown requested; no longer pulling deliveries");
                    break;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    if self.stop.is_cancelled() {
                        break;
                    }
                    return Err(crate::broker::BrokerError::Closed.into());
                }
            };

            self.process(delivery, &mut stats).await?;
        }

        Ok(stats)
    }

    async fn process(&self, delivery: Delivery, stats: &mut QueueStats) -> PipelineResult<()> {
        if delivery.redelivered() {
            debug!(queue = %self.queue, "processing redelivered message");
        }

        let outcome = {
            let handling = self.handler.handle(delivery.body());
            tokio::pin!(handling);
            tokio::select! {
                result = &mut handling => Some(result),
                _ = self.stop.cancelled() => {
                    self.state.send_replace(SubscriptionState::Draining);
                    debug!(queue = %self.queue, grace = ?self.grace, "draining in-flight message");
                    tokio::select! {
                        result = &mut handling => Some(result),
                        _ = tokio::time::sleep(self.grace) => None,
                    }
                }
            }
        };

        match outcome {
            Some(Ok(())) => {
                delivery.ack().await?;
                stats.acked += 1;
                Ok(())
            }
            Some(Err(e)) => {
                delivery.reject().await?;
                stats.rejected += 1;
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(queue = %self.queue, class = ?e.class(), error = %e, "message rejected");
                Ok(())
            }
            None => {
                warn!(queue = %self.queue, grace = ?self.grace, "shutdown grace elapsed; rejecting in-flight message");
                delivery.reject().await?;
                stats.rejected += 1;
                Ok(())
            }
        }
    }
}
