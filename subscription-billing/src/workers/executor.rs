//! Cycle executor.
//!
//! A bounded queue in front of a fixed pool of workers that run billing
//! cycles. A subscription is held in the dedupe set from the moment it is
//! enqueued until its cycle finishes, so a second enqueue for it in that
//! window is reported as deduplicated instead of starting a concurrent cycle.

use crate::engine::orchestrator::BillingOrchestrator;
use crate::services::metrics;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::join_all;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Request to run one billing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleRequest {
    pub tenant_id: Uuid,
    pub subscription_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueResult {
    Enqueued,
    Deduplicated,
}

impl EnqueueResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnqueueResult::Enqueued => "enqueued",
            EnqueueResult::Deduplicated => "deduplicated",
        }
    }
}

/// Starts billing cycles. Injected into the fleet scheduler and the admin API.
#[async_trait]
pub trait CycleEnqueuer: Send + Sync {
    async fn enqueue(&self, request: CycleRequest) -> Result<EnqueueResult, AppError>;
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    pub queue_size: usize,
    pub cycle_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            queue_size: 1000,
            cycle_timeout: Duration::from_secs(1800),
        }
    }
}

pub struct CycleExecutor {
    sender: mpsc::Sender<CycleRequest>,
    in_flight: Arc<DashMap<Uuid, CycleRequest>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CycleExecutor {
    /// Spawn the worker pool. Workers stop when `shutdown` is cancelled.
    pub fn start(
        orchestrator: Arc<BillingOrchestrator>,
        config: ExecutorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(DashMap::new());

        let worker_count = config.worker_count.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    orchestrator.clone(),
                    receiver.clone(),
                    in_flight.clone(),
                    config.cycle_timeout,
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(
            worker_count = worker_count,
            queue_size = config.queue_size,
            cycle_timeout_secs = config.cycle_timeout.as_secs(),
            "Cycle executor started"
        );

        Self {
            sender,
            in_flight,
            workers: Mutex::new(workers),
        }
    }

    /// Subscriptions queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, subscription_id: Uuid) -> bool {
        self.in_flight.contains_key(&subscription_id)
    }

    /// Wait for every worker to exit after shutdown was requested.
    pub async fn join(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Cycle worker panicked");
            }
        }
    }
}

#[async_trait]
impl CycleEnqueuer for CycleExecutor {
    async fn enqueue(&self, request: CycleRequest) -> Result<EnqueueResult, AppError> {
        match self.in_flight.entry(request.subscription_id) {
            Entry::Occupied(_) => return Ok(EnqueueResult::Deduplicated),
            Entry::Vacant(slot) => {
                slot.insert(request);
            }
        }

        if let Err(e) = self.sender.try_send(request) {
            self.in_flight.remove(&request.subscription_id);
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "cycle queue is full",
                mpsc::error::TrySendError::Closed(_) => "cycle executor is shut down",
            };
            return Err(AppError::ServiceUnavailable(reason.to_string()));
        }

        Ok(EnqueueResult::Enqueued)
    }
}

async fn worker_loop(
    worker_id: usize,
    orchestrator: Arc<BillingOrchestrator>,
    receiver: Arc<Mutex<mpsc::Receiver<CycleRequest>>>,
    in_flight: Arc<DashMap<Uuid, CycleRequest>>,
    cycle_timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => break,
            request = async { receiver.lock().await.recv().await } => match request {
                Some(request) => request,
                None => break,
            },
        };

        let result = tokio::time::timeout(
            cycle_timeout,
            orchestrator.run_cycle(request.tenant_id, request.subscription_id, Utc::now()),
        )
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(
                    worker_id = worker_id,
                    subscription_id = %request.subscription_id,
                    error = %e,
                    "Billing cycle ended with error"
                );
            }
            Err(_) => {
                error!(
                    worker_id = worker_id,
                    subscription_id = %request.subscription_id,
                    timeout_secs = cycle_timeout.as_secs(),
                    "Billing cycle timed out"
                );
                metrics::record_error("transient", "billing_cycle_timeout");
            }
        }

        in_flight.remove(&request.subscription_id);
    }

    info!(worker_id = worker_id, "Cycle worker stopped");
}
