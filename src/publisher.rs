//! Persistent, confirmed publishing of JSON envelopes.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::broker::{Broker, BrokerError, Connector};
use crate::error::PipelineResult;
use crate::topology::{ensure_topology, TopologyConfig};

/// Publishes envelopes over a lazily opened, reused broker connection.
///
/// A publish that finds the connection broken reconnects at most once per
/// call; a second failure is returned to the caller.
pub struct Publisher {
    connector: Arc<dyn Connector>,
    broker: Mutex<Option<Arc<dyn Broker>>>,
}

impl Publisher {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            broker: Mutex::new(None),
        }
    }

    /// Open the connection now and declare `topology` on it.
    pub async fn bootstrap(&self, topology: &TopologyConfig) -> PipelineResult<()> {
        let mut guard = self.broker.lock().await;
        let broker = self.connector.connect().await?;
        ensure_topology(broker.as_ref(), topology).await?;
        *guard = Some(broker);
        Ok(())
    }

    /// Serialize `envelope` as JSON and publish it persistently to `queue`.
    /// Returns once the broker confirmed the enqueue.
    pub async fn publish<T>(&self, envelope: &T, queue: &str) -> PipelineResult<()>
    where
        T: Serialize + Sync,
    {
        let payload = serde_json::to_vec(envelope).map_err(BrokerError::from)?;

        let mut guard = self.broker.lock().await;
        let mut reconnected = false;

        let current = guard.as_ref().filter(|b| b.is_open()).cloned();
        let broker = match current {
            Some(broker) => broker,
            None => {
                reconnected = guard.is_some();
                let broker = self.connector.connect().await?;
                *guard = Some(broker.clone());
                broker
            }
        };

        match broker.publish(queue, &payload).await {
            Ok(()) => {}
            Err(err) if err.is_connection_lost() && !reconnected => {
                warn!(queue, error = %err, "publish failed on a broken connection; reconnecting");
                let broker = self.connector.connect().await?;
                *guard = Some(broker.clone());
                broker.publish(queue, &payload).await?;
            }
            Err(err) => return Err(err.into()),
        }

        debug!(queue, bytes = payload.len(), "published message");
        Ok(())
    }

    /// Close the underlying connection, if one is open.
    pub async fn close(&self) -> PipelineResult<()> {
        if let Some(broker) = self.broker.lock().await.take() {
            broker.close().await?;
        }
        Ok(())
    }
}
