//! Application startup and lifecycle management.

use crate::config::{BillingConfig, QueueBackend, StoreBackend};
use crate::engine::{BillingOrchestrator, FleetScheduler};
use crate::models::{BillingRun, BillingRunResult, BillingRunType};
use crate::services::{
    get_metrics, init_metrics, BillingRunStore, Database, DisabledPaymentGateway,
    DisabledVendorSync, HttpPaymentGateway, HttpVendorSync, InMemoryInvoiceQueue, InMemoryStore,
    InvoiceQueue, LineItemPricer, PaymentGateway, RedisInvoiceQueue, Stores, SubscriptionStore,
    VendorSync,
};
use crate::workers::{
    CycleEnqueuer, CycleExecutor, CycleRequest, EnqueueResult, ExecutorConfig, InvoiceProcessor,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use validator::Validate;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub scheduler: Arc<FleetScheduler>,
    pub enqueuer: Arc<dyn CycleEnqueuer>,
    pub default_batch_size: i64,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct TriggerRunRequest {
    #[validate(range(min = 1, max = 10000))]
    pub batch_size: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct BillingRunResponse {
    pub run: BillingRun,
    pub results: Vec<BillingRunResult>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub subscription_id: Uuid,
    pub result: EnqueueResult,
}

/// Liveness probe.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.stores.subscriptions.health_check().await {
        Ok(_) => {
            tracing::debug!("Health check passed");
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "service": "subscription-billing",
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed - store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "subscription-billing",
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Readiness probe.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.stores.subscriptions.health_check().await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Prometheus scrape endpoint.
async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        get_metrics(),
    )
}

/// Run a manual fleet scan and return the finished run.
async fn trigger_billing_run(
    State(state): State<AppState>,
    Json(request): Json<TriggerRunRequest>,
) -> Result<Json<BillingRun>, AppError> {
    request.validate()?;
    let batch_size = request.batch_size.unwrap_or(state.default_batch_size);
    let run = state
        .scheduler
        .run_once(BillingRunType::Manual, batch_size)
        .await?;
    Ok(Json(run))
}

async fn get_billing_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<BillingRunResponse>, AppError> {
    let run = state
        .stores
        .runs
        .get_billing_run(run_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("billing run {} not found", run_id)))?;
    let results = state.stores.runs.get_billing_run_results(run_id).await?;
    Ok(Json(BillingRunResponse { run, results }))
}

/// Enqueue one subscription's billing cycle.
async fn process_subscription(
    State(state): State<AppState>,
    Path((tenant_id, subscription_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    state
        .stores
        .subscriptions
        .get_subscription(tenant_id, subscription_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("subscription {} not found", subscription_id))
        })?;

    let result = state
        .enqueuer
        .enqueue(CycleRequest {
            tenant_id,
            subscription_id,
        })
        .await?;

    tracing::info!(
        subscription_id = %subscription_id,
        result = result.as_str(),
        "Billing cycle requested"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            subscription_id,
            result,
        }),
    ))
}

/// Build the HTTP router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .route("/v1/billing/runs", post(trigger_billing_run))
        .route("/v1/billing/runs/:run_id", get(get_billing_run))
        .route(
            "/v1/billing/subscriptions/:tenant_id/:subscription_id/process",
            post(process_subscription),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    config: BillingConfig,
    state: AppState,
    executor: Arc<CycleExecutor>,
    processor: Arc<InvoiceProcessor>,
    queue: Arc<dyn InvoiceQueue>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: BillingConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(config: BillingConfig, run_migrations: bool) -> Result<Self, AppError> {
        init_metrics();

        let stores = match (config.store, &config.database) {
            (StoreBackend::Postgres, Some(database)) => {
                let db = Database::new(
                    &database.url,
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                if run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        e
                    })?;
                }

                Stores::from_store(Arc::new(db))
            }
            (StoreBackend::Postgres, None) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "PostgreSQL store selected without database settings"
                )))
            }
            (StoreBackend::Memory, _) => {
                tracing::warn!("Using in-memory store - state is lost on restart");
                Stores::from_store(Arc::new(InMemoryStore::new()))
            }
        };

        let queue: Arc<dyn InvoiceQueue> = match config.invoice_queue.backend {
            QueueBackend::Redis => {
                let queue =
                    RedisInvoiceQueue::new(&config.invoice_queue.redis_url, &config.invoice_queue.key)
                        .await?;
                queue.recover_in_flight().await?;
                Arc::new(queue)
            }
            QueueBackend::Memory => Arc::new(InMemoryInvoiceQueue::new()),
        };

        let vendor: Arc<dyn VendorSync> = match &config.vendors.vendor_sync_url {
            Some(url) => Arc::new(HttpVendorSync::new(url, config.vendors.request_timeout)?),
            None => {
                tracing::info!("Vendor sync URL not configured - invoice export will be skipped");
                Arc::new(DisabledVendorSync)
            }
        };
        let gateway: Arc<dyn PaymentGateway> = match &config.vendors.payment_gateway_url {
            Some(url) => Arc::new(HttpPaymentGateway::new(url, config.vendors.request_timeout)?),
            None => {
                tracing::info!("Payment gateway URL not configured - payments will be skipped");
                Arc::new(DisabledPaymentGateway)
            }
        };

        let calculator = Arc::new(LineItemPricer::new(stores.subscriptions.clone()));
        let orchestrator = Arc::new(BillingOrchestrator::from_stores(
            &stores,
            calculator,
            queue.clone(),
            config.retry.internal.clone(),
        ));

        let shutdown = CancellationToken::new();
        let executor = Arc::new(CycleExecutor::start(
            orchestrator,
            ExecutorConfig {
                worker_count: config.executor.worker_count,
                queue_size: config.executor.queue_size,
                cycle_timeout: config.executor.cycle_timeout,
            },
            shutdown.clone(),
        ));

        let scheduler = Arc::new(FleetScheduler::new(
            stores.subscriptions.clone(),
            stores.runs.clone(),
            executor.clone(),
            config.retry.internal.clone(),
        ));

        let processor = Arc::new(InvoiceProcessor::new(
            stores.invoices.clone(),
            stores.subscriptions.clone(),
            vendor,
            gateway,
            config.retry.external.clone(),
        ));

        let state = AppState {
            stores,
            scheduler,
            enqueuer: executor.clone(),
            default_batch_size: config.scheduler.batch_size,
        };

        let addr = config.common.bind_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Subscription billing listener bound");

        Ok(Self {
            port,
            listener,
            config,
            state,
            executor,
            processor,
            queue,
            shutdown,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the HTTP server, the fleet scheduler and the invoice workers until
    /// the server stops or this future is dropped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let _shutdown_guard = self.shutdown.clone().drop_guard();

        let invoice_workers = self.processor.clone().spawn_workers(
            self.queue.clone(),
            self.config.invoice_queue.worker_count,
            self.shutdown.clone(),
        );

        let scheduler_task = if self.config.scheduler.enabled {
            Some(tokio::spawn(self.state.scheduler.clone().run(
                self.config.scheduler.interval,
                self.config.scheduler.batch_size,
                self.shutdown.clone(),
            )))
        } else {
            tracing::info!("Fleet scheduler disabled");
            None
        };

        tracing::info!(port = self.port, "HTTP server starting");
        let result = axum::serve(self.listener, router(self.state.clone()))
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .await;

        self.shutdown.cancel();
        if let Some(task) = scheduler_task {
            let _ = task.await;
        }
        for worker in invoice_workers {
            let _ = worker.await;
        }
        self.executor.join().await;

        result
    }
}
