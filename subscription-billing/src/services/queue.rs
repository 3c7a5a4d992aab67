//! Downstream invoice event queue.
//!
//! The billing cycle publishes one [`InvoiceEvent`] per finalized invoice and
//! returns; the invoice processor consumes them. Delivery is at-least-once:
//! a message stays claimed until it is acknowledged.

use crate::models::InvoiceEvent;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client};
use service_core::error::AppError;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, instrument, warn};

/// A claimed message. Acknowledge it once processing is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceDelivery {
    pub event: InvoiceEvent,
    payload: String,
}

#[async_trait]
pub trait InvoiceQueue: Send + Sync {
    async fn publish(&self, event: &InvoiceEvent) -> Result<(), AppError>;

    /// Wait up to `wait` for the next message.
    async fn receive(&self, wait: Duration) -> Result<Option<InvoiceDelivery>, AppError>;

    async fn ack(&self, delivery: &InvoiceDelivery) -> Result<(), AppError>;

    /// Release a claimed message back to the queue for another delivery.
    async fn requeue(&self, delivery: &InvoiceDelivery) -> Result<(), AppError>;
}

fn encode(event: &InvoiceEvent) -> Result<String, AppError> {
    serde_json::to_string(event)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to encode invoice event: {}", e)))
}

// =========================================================================
// Redis
// =========================================================================

/// Redis list queue. Claimed messages move to `<key>:processing` until acked.
#[derive(Clone)]
pub struct RedisInvoiceQueue {
    manager: ConnectionManager,
    key: String,
    processing_key: String,
}

impl RedisInvoiceQueue {
    pub async fn new(url: &str, key: &str) -> Result<Self, AppError> {
        info!(url = %url, key = %key, "Connecting invoice queue to Redis");
        let client = Client::open(url)?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            AppError::ServiceUnavailable(format!("Failed to connect to Redis: {}", e))
        })?;

        Ok(Self {
            manager,
            key: key.to_string(),
            processing_key: format!("{}:processing", key),
        })
    }

    /// Return messages claimed by a previous process that never acked them.
    pub async fn recover_in_flight(&self) -> Result<usize, AppError> {
        let mut conn = self.manager.clone();
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.key)
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered = recovered, "Requeued unacknowledged invoice events");
        }
        Ok(recovered)
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl InvoiceQueue for RedisInvoiceQueue {
    #[instrument(skip(self, event), fields(invoice_id = %event.invoice_id))]
    async fn publish(&self, event: &InvoiceEvent) -> Result<(), AppError> {
        let payload = encode(event)?;
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LPUSH")
            .arg(&self.key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<InvoiceDelivery>, AppError> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.key)
            .arg(&self.processing_key)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<InvoiceEvent>(&payload) {
            Ok(event) => Ok(Some(InvoiceDelivery { event, payload })),
            Err(e) => {
                warn!(error = %e, payload = %payload, "Dropping undecodable invoice event");
                let _: i64 = redis::cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&payload)
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &InvoiceDelivery) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &InvoiceDelivery) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&delivery.payload)
            .ignore()
            .cmd("LPUSH")
            .arg(&self.key)
            .arg(&delivery.payload)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

// =========================================================================
// In-memory
// =========================================================================

/// Channel-backed queue for tests and single-process runs. Acks are no-ops.
pub struct InMemoryInvoiceQueue {
    sender: mpsc::UnboundedSender<InvoiceEvent>,
    receiver: Mutex<mpsc::UnboundedReceiver<InvoiceEvent>>,
    published: Mutex<Vec<InvoiceEvent>>,
    requeued: Mutex<Vec<InvoiceEvent>>,
}

impl Default for InMemoryInvoiceQueue {
    fn default() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            published: Mutex::new(Vec::new()),
            requeued: Mutex::new(Vec::new()),
        }
    }
}

impl InMemoryInvoiceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event published so far, in order.
    pub async fn published(&self) -> Vec<InvoiceEvent> {
        self.published.lock().await.clone()
    }

    /// Every event handed back for redelivery, in order.
    pub async fn requeued(&self) -> Vec<InvoiceEvent> {
        self.requeued.lock().await.clone()
    }
}

#[async_trait]
impl InvoiceQueue for InMemoryInvoiceQueue {
    async fn publish(&self, event: &InvoiceEvent) -> Result<(), AppError> {
        self.sender
            .send(event.clone())
            .map_err(|_| AppError::ServiceUnavailable("invoice queue is closed".to_string()))?;
        self.published.lock().await.push(event.clone());
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<InvoiceDelivery>, AppError> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(event)) => {
                let payload = encode(&event)?;
                Ok(Some(InvoiceDelivery { event, payload }))
            }
            Ok(None) | Err(_) => Ok(None),
        }
    }

    async fn ack(&self, _delivery: &InvoiceDelivery) -> Result<(), AppError> {
        Ok(())
    }

    async fn requeue(&self, delivery: &InvoiceDelivery) -> Result<(), AppError> {
        self.sender
            .send(delivery.event.clone())
            .map_err(|_| AppError::ServiceUnavailable("invoice queue is closed".to_string()))?;
        self.requeued.lock().await.push(delivery.event.clone());
        Ok(())
    }
}
