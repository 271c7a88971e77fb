//! In-process broker.
//!
//! A [`MemoryBus`] plays the role of the broker server: it owns exchanges,
//! queues and messages. Each [`MemoryBroker`] is one connection handle onto
//! the bus; closing a handle breaks only that connection and returns its
//! unacknowledged deliveries to their queues, marked as redelivered.
//!
//! Expiry follows queue TTL semantics using `tokio::time`, so tests can
//! drive it with a paused clock:
//!
//! - A ready message older than the queue's TTL is moved to the queue's
//!   dead-letter exchange.
//! - A rejected message on a queue with a TTL is held back and dead-lettered
//!   once its TTL (measured from the original enqueue) elapses. Without a TTL
//!   it is dead-lettered immediately.
//! - Messages that reach an exchange without bindings are dropped.
//!
//! Publishing to a queue that was never declared fails with
//! [`BrokerError::NotFound`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    Acknowledger, Broker, BrokerError, Connector, Delivery, DeliveryStream, ExchangeKind,
    QueueSpec,
};

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
    next_handle: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, MemExchange>,
    queues: HashMap<String, MemQueue>,
    next_tag: u64,
}

struct MemExchange {
    kind: ExchangeKind,
    bindings: Vec<String>,
}

struct MemQueue {
    spec: QueueSpec,
    ready: VecDeque<Message>,
    unacked: HashMap<u64, (u64, Message)>,
    rejected: Vec<Message>,
}

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    enqueued_at: Instant,
    redelivered: bool,
}

impl State {
    fn sweep(&mut self, now: Instant) {
        let mut dead: Vec<(String, Message)> = Vec::new();

        for queue in self.queues.values_mut() {
            let ttl = match queue.spec.message_ttl_ms {
                Some(ms) => Duration::from_millis(u64::from(ms)),
                None => continue,
            };
            let dlx = queue.spec.dead_letter_exchange.clone();

            let mut kept = VecDeque::with_capacity(queue.ready.len());
            for message in queue.ready.drain(..) {
                if now.duration_since(message.enqueued_at) >= ttl {
                    if let Some(dlx) = &dlx {
                        dead.push((dlx.clone(), message));
                    }
                } else {
                    kept.push_back(message);
                }
            }
            queue.ready = kept;

            let mut held = Vec::with_capacity(queue.rejected.len());
            for message in queue.rejected.drain(..) {
                if now.duration_since(message.enqueued_at) >= ttl {
                    if let Some(dlx) = &dlx {
                        dead.push((dlx.clone(), message));
                    }
                } else {
                    held.push(message);
                }
            }
            queue.rejected = held;
        }

        for (exchange, message) in dead {
            self.route(&exchange, message.body, now);
        }
    }

    fn route(&mut self, exchange: &str, body: Vec<u8>, now: Instant) {
        let bindings = match self.exchanges.get(exchange) {
            Some(ex) => ex.bindings.clone(),
            None => return,
        };
        for name in bindings {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(Message {
                    body: body.clone(),
                    enqueued_at: now,
                    redelivered: false,
                });
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.queues
            .values()
            .filter_map(|queue| {
                let ttl = Duration::from_millis(u64::from(queue.spec.message_ttl_ms?));
                queue
                    .ready
                    .iter()
                    .chain(queue.rejected.iter())
                    .map(|m| m.enqueued_at + ttl)
                    .min()
            })
            .min()
    }

    fn pop_ready(&mut self, queue: &str, handle: u64) -> Result<Option<(u64, Message)>, BrokerError> {
        let tag = self.next_tag;
        let q = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", queue)))?;
        match q.ready.pop_front() {
            Some(message) => {
                q.unacked.insert(tag, (handle, message.clone()));
                self.next_tag += 1;
                Ok(Some((tag, message)))
            }
            None => Ok(None),
        }
    }
}

/// The shared broker state. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection handle.
    pub fn handle(&self) -> MemoryBroker {
        MemoryBroker {
            shared: self.shared.clone(),
            id: self.shared.next_handle.fetch_add(1, Ordering::SeqCst),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            bus: self.clone(),
            refuse: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Apply TTL expiry as of the current (tokio) time.
    pub fn sweep(&self) {
        self.shared.lock().sweep(Instant::now());
        self.shared.notify.notify_waiters();
    }

    /// Messages waiting for delivery, after expiry.
    pub fn ready_count(&self, queue: &str) -> usize {
        let mut state = self.shared.lock();
        state.sweep(Instant::now());
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Remove and return every ready message body in `queue`, after expiry.
    pub fn take(&self, queue: &str) -> Vec<Vec<u8>> {
        let mut state = self.shared.lock();
        state.sweep(Instant::now());
        match state.queues.get_mut(queue) {
            Some(q) => q.ready.drain(..).map(|m| m.body).collect(),
            None => Vec::new(),
        }
    }

    pub fn queue_spec(&self, queue: &str) -> Option<QueueSpec> {
        self.shared.lock().queues.get(queue).map(|q| q.spec.clone())
    }

    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.shared.lock().exchanges.get(exchange).map(|e| e.kind)
    }

    pub fn bindings(&self, exchange: &str) -> Vec<String> {
        self.shared
            .lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }
}

/// One connection onto a [`MemoryBus`].
pub struct MemoryBroker {
    shared: Arc<Shared>,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryBroker {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Closed)
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!("exchange '{}' already declared as {:?}", name, existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    MemExchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(BrokerError::PreconditionFailed(
                format!("queue '{}' already declared with different arguments", spec.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    spec.name.clone(),
                    MemQueue {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        unacked: HashMap::new(),
                        rejected: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{}'", queue)));
        }
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{}'", exchange)))?;
        if !ex.bindings.iter().any(|b| b == queue) {
            ex.bindings.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.ensure_open()?;
        {
            let mut state = self.shared.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", queue)))?;
            q.ready.push_back(Message {
                body: payload.to_vec(),
                enqueued_at: Instant::now(),
                redelivered: false,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;
        if !self.shared.lock().queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue '{}'", queue)));
        }

        let subscription = Subscription {
            shared: self.shared.clone(),
            queue: queue.to_string(),
            handle: self.id,
            open: self.open.clone(),
        };
        let stream = futures::stream::unfold(subscription, |sub| async move {
            let item = sub.next_delivery().await?;
            Some((item, sub))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.shared.lock();
            for queue in state.queues.values_mut() {
                let owned: Vec<u64> = queue
                    .unacked
                    .iter()
                    .filter(|(_, (handle, _))| *handle == self.id)
                    .map(|(tag, _)| *tag)
                    .collect();
                for tag in owned {
                    if let Some((_, mut message)) = queue.unacked.remove(&tag) {
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    }
                }
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct Subscription {
    shared: Arc<Shared>,
    queue: String,
    handle: u64,
    open: Arc<AtomicBool>,
}

impl Subscription {
    async fn next_delivery(&self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                if !self.open.load(Ordering::SeqCst) {
                    return None;
                }
                let mut state = self.shared.lock();
                state.sweep(Instant::now());
                match state.pop_ready(&self.queue, self.handle) {
                    Err(e) => return Some(Err(e)),
                    Ok(Some((tag, message))) => {
                        let acker = MemoryAcker {
                            shared: self.shared.clone(),
                            queue: self.queue.clone(),
                            tag,
                        };
                        return Some(Ok(Delivery::new(
                            message.body,
                            message.redelivered,
                            Box::new(acker),
                        )));
                    }
                    Ok(None) => state.next_expiry(),
                }
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(MemQueueRef, Message), BrokerError> {
        let mut state = self.shared.lock();
        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{}'", self.queue)))?;
        let (_, message) = q.unacked.remove(&self.tag).ok_or(BrokerError::Closed)?;
        Ok((
            MemQueueRef {
                ttl: q.spec.message_ttl_ms,
                dlx: q.spec.dead_letter_exchange.clone(),
            },
            message,
        ))
    }
}

struct MemQueueRef {
    ttl: Option<u32>,
    dlx: Option<String>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        Ok(())
    }

    async fn reject(&self) -> Result<(), BrokerError> {
        let (queue, message) = self.settle()?;
        {
            let mut state = self.shared.lock();
            match (queue.ttl, queue.dlx) {
                (Some(_), Some(_)) => {
                    if let Some(q) = state.queues.get_mut(&self.queue) {
                        q.rejected.push(message);
                    }
                }
                (None, Some(dlx)) => state.route(&dlx, message.body, Instant::now()),
                (_, None) => {}
            }
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

/// Hands out fresh handles onto a bus; can be told to refuse attempts.
pub struct MemoryConnector {
    bus: MemoryBus,
    refuse: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Connection("connection refused".into()));
        }
        Ok(Arc::new(self.bus.handle()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declare(broker: &MemoryBroker) {
        broker
            .declare_exchange("dlx", ExchangeKind::Fanout)
            .await
            .unwrap();
        broker.declare_queue(&QueueSpec::durable("dlq")).await.unwrap();
        broker.bind_queue("dlq", "dlx").await.unwrap();
        broker
            .declare_queue(
                &QueueSpec::durable("rag_queue")
                    .with_ttl(60_000)
                    .with_dead_letter("dlx"),
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_consume_ack() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        declare(&broker).await;

        broker.publish("rag_queue", b"{\"n\":1}").await.unwrap();
        assert_eq!(bus.ready_count("rag_queue"), 1);

        let mut stream = broker.subscribe("rag_queue", "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body(), b"{\"n\":1}");
        assert!(!delivery.redelivered());
        assert_eq!(bus.unacked_count("rag_queue"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(bus.unacked_count("rag_queue"), 0);
        assert_eq!(bus.ready_count("rag_queue"), 0);
    }

    #[tokio::test]
    async fn test_redeclare_with_other_arguments_fails() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        declare(&broker).await;
        declare(&broker).await;

        let err = broker
            .declare_queue(&QueueSpec::durable("rag_queue").with_ttl(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));

        let err = broker
            .declare_exchange("dlx", ExchangeKind::Direct)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::PreconditionFailed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dead_lettered() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        declare(&broker).await;

        broker.publish("rag_queue", b"stale").await.unwrap();
        tokio::time::advance(Duration::from_millis(59_999)).await;
        assert_eq!(bus.ready_count("rag_queue"), 1);
        assert_eq!(bus.ready_count("dlq"), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(bus.ready_count("rag_queue"), 0);
        assert_eq!(bus.take("dlq"), vec![b"stale".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_message_dead_lettered_once_after_ttl() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        declare(&broker).await;

        broker.publish("rag_queue", b"bad").await.unwrap();
        let mut stream = broker.subscribe("rag_queue", "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject().await.unwrap();

        assert_eq!(bus.ready_count("rag_queue"), 0);
        assert_eq!(bus.ready_count("dlq"), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(bus.ready_count("dlq"), 1);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(bus.ready_count("dlq"), 1);
        assert_eq!(bus.ready_count("rag_queue"), 0);
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_as_redelivered() {
        let bus = MemoryBus::new();
        let first = bus.handle();
        declare(&first).await;
        first.publish("rag_queue", b"m").await.unwrap();

        let mut stream = first.subscribe("rag_queue", "t").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        first.close().await.unwrap();

        assert!(delivery.ack().await.is_err());
        assert!(stream.next().await.is_none());
        assert_eq!(bus.ready_count("rag_queue"), 1);

        let second = bus.handle();
        let mut stream = second.subscribe("rag_queue", "t").await.unwrap();
        let again = stream.next().await.unwrap().unwrap();
        assert!(again.redelivered());
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_publish() {
        let bus = MemoryBus::new();
        let broker = bus.handle();
        declare(&broker).await;
        broker.close().await.unwrap();
        assert!(!broker.is_open());

        let err = broker.publish("rag_queue", b"x").await.unwrap_err();
        assert!(err.is_connection_lost());

        let missing = bus.handle().publish("nope", b"x").await.unwrap_err();
        assert!(matches!(missing, BrokerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_connector_refuses_then_connects() {
        let bus = MemoryBus::new();
        let connector = bus.connector();
        connector.refuse_next(2);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        let broker = connector.connect().await.unwrap();
        assert!(broker.is_open());
        assert_eq!(connector.attempts(), 3);
    }
}
