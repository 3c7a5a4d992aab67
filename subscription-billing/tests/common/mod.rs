//! Test helper module for subscription-billing integration tests.
//!
//! Wires the engine over the in-memory store and queue, and provides fixture
//! builders plus collaborators that fail on demand.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use service_core::retry::RetryPolicy;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subscription_billing::config::{
    BillingConfig, ExecutorSettings, InvoiceQueueConfig, QueueBackend, RetryConfig,
    SchedulerConfig, StoreBackend, VendorConfig,
};
use subscription_billing::engine::{BillingOrchestrator, FleetScheduler, DEFAULT_BATCH_SIZE};
use subscription_billing::models::{
    BillingPeriod, DraftInvoice, Invoice, InvoiceEvent, InvoiceLineItem, PauseMode, PauseStatus,
    PaymentStatus, Subscription, SubscriptionLineItem, SubscriptionPause, SubscriptionStatus,
};
use subscription_billing::services::{
    init_metrics, InMemoryInvoiceQueue, InMemoryStore, InvoiceCalculator, InvoiceQueue,
    InvoiceStore, LineItemPricer, Stores, SubscriptionStore,
};
use subscription_billing::startup::{router, AppState, Application};
use subscription_billing::workers::{
    CycleEnqueuer, CycleExecutor, CycleRequest, EnqueueResult, ExecutorConfig,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const TEST_TENANT_ID: &str = "11111111-1111-1111-1111-111111111111";

pub fn tenant_id() -> Uuid {
    Uuid::parse_str(TEST_TENANT_ID).unwrap()
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn period(start: DateTime<Utc>, end: DateTime<Utc>) -> BillingPeriod {
    BillingPeriod::new(start, end)
}

/// Retry policy with millisecond backoff so failing tests stay fast.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        add_jitter: false,
    }
}

/// Monthly subscription anchored on 2024-01-01, currently in Jan 1 - Feb 1.
pub fn monthly_subscription() -> Subscription {
    Subscription {
        subscription_id: Uuid::new_v4(),
        tenant_id: tenant_id(),
        environment_id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        plan_id: Uuid::new_v4(),
        status: SubscriptionStatus::Active.as_str().to_string(),
        currency: "USD".to_string(),
        billing_anchor: at(2024, 1, 1),
        billing_cadence: "monthly".to_string(),
        billing_period_count: 1,
        current_period_start: at(2024, 1, 1),
        current_period_end: at(2024, 2, 1),
        end_date: None,
        cancel_at_period_end: false,
        cancel_at: None,
        cancelled_at: None,
        pause_status: PauseStatus::None.as_str().to_string(),
        active_pause_id: None,
        payment_method_id: Some("pm_test_visa".to_string()),
        published: true,
        version: 1,
        created_utc: at(2024, 1, 1),
        updated_utc: at(2024, 1, 1),
    }
}

pub fn line_item(
    subscription: &Subscription,
    quantity: i64,
    unit_amount_cents: i64,
) -> SubscriptionLineItem {
    SubscriptionLineItem {
        line_item_id: Uuid::new_v4(),
        subscription_id: subscription.subscription_id,
        price_id: Some(Uuid::new_v4()),
        description: "Pro plan seat".to_string(),
        quantity: Decimal::from(quantity),
        unit_amount: Decimal::new(unit_amount_cents, 2),
        start_date: None,
        end_date: None,
    }
}

pub fn pause_for(
    subscription: &Subscription,
    mode: PauseMode,
    status: PauseStatus,
    pause_start: DateTime<Utc>,
    pause_end: Option<DateTime<Utc>>,
) -> SubscriptionPause {
    SubscriptionPause {
        pause_id: Uuid::new_v4(),
        tenant_id: subscription.tenant_id,
        subscription_id: subscription.subscription_id,
        pause_mode: mode.as_str().to_string(),
        pause_status: status.as_str().to_string(),
        pause_start,
        pause_end,
        resumed_at: None,
        version: 1,
        created_utc: pause_start,
        updated_utc: pause_start,
    }
}

/// Engine wired over the in-memory store and a recording queue.
pub struct TestContext {
    pub store: Arc<InMemoryStore>,
    pub stores: Stores,
    pub queue: Arc<InMemoryInvoiceQueue>,
    pub orchestrator: Arc<BillingOrchestrator>,
}

impl TestContext {
    pub fn new() -> Self {
        init_metrics();
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_store(store.clone());
        let calculator = Arc::new(LineItemPricer::new(stores.subscriptions.clone()));
        let queue = Arc::new(InMemoryInvoiceQueue::new());
        Self::build(store, stores, calculator, queue)
    }

    /// Same wiring with invoice writes going through `invoices`.
    pub fn with_invoice_store(
        invoices: Arc<dyn InvoiceStore>,
        store: Arc<InMemoryStore>,
    ) -> Self {
        init_metrics();
        let mut stores = Stores::from_store(store.clone());
        stores.invoices = invoices;
        let calculator = Arc::new(LineItemPricer::new(stores.subscriptions.clone()));
        let queue = Arc::new(InMemoryInvoiceQueue::new());
        Self::build(store, stores, calculator, queue)
    }

    /// Same wiring publishing through `queue`; `self.queue` stays unused.
    pub fn with_queue(queue: Arc<dyn InvoiceQueue>) -> Self {
        init_metrics();
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_store(store.clone());
        let calculator = Arc::new(LineItemPricer::new(stores.subscriptions.clone()));
        let orchestrator = Arc::new(BillingOrchestrator::from_stores(
            &stores,
            calculator,
            queue,
            fast_policy(),
        ));
        Self {
            store,
            stores,
            queue: Arc::new(InMemoryInvoiceQueue::new()),
            orchestrator,
        }
    }

    pub fn with_calculator(calculator: Arc<dyn InvoiceCalculator>) -> Self {
        init_metrics();
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_store(store.clone());
        let queue = Arc::new(InMemoryInvoiceQueue::new());
        Self::build(store, stores, calculator, queue)
    }

    fn build(
        store: Arc<InMemoryStore>,
        stores: Stores,
        calculator: Arc<dyn InvoiceCalculator>,
        queue: Arc<InMemoryInvoiceQueue>,
    ) -> Self {
        let orchestrator = Arc::new(BillingOrchestrator::from_stores(
            &stores,
            calculator,
            queue.clone(),
            fast_policy(),
        ));
        Self {
            store,
            stores,
            queue,
            orchestrator,
        }
    }

    /// Insert a subscription with one 10 x 9.99 line item.
    pub async fn seed(&self, subscription: Subscription) -> Subscription {
        self.store
            .insert_line_item(line_item(&subscription, 10, 999))
            .await;
        self.store.insert_subscription(subscription.clone()).await;
        subscription
    }

    pub async fn subscription(&self, subscription_id: Uuid) -> Subscription {
        self.stores
            .subscriptions
            .get_subscription(tenant_id(), subscription_id)
            .await
            .unwrap()
            .expect("subscription should exist")
    }

    pub async fn pause(&self, pause_id: Uuid) -> SubscriptionPause {
        self.stores
            .subscriptions
            .get_pause(tenant_id(), pause_id)
            .await
            .unwrap()
            .expect("pause should exist")
    }

    pub async fn invoices(&self, subscription_id: Uuid) -> Vec<Invoice> {
        self.store.invoices_for_subscription(subscription_id).await
    }
}

/// Invoice store that fails selected operations a fixed number of times
/// before delegating to the in-memory store.
pub struct FlakyInvoiceStore {
    inner: Arc<InMemoryStore>,
    create_failures: AtomicU32,
    finalize_failures: AtomicU32,
    /// Only periods starting here fail on create; `None` fails every period.
    fail_create_at: Option<DateTime<Utc>>,
    permanent: bool,
}

impl FlakyInvoiceStore {
    pub fn failing_create(
        inner: Arc<InMemoryStore>,
        times: u32,
        period_start: Option<DateTime<Utc>>,
        permanent: bool,
    ) -> Self {
        Self {
            inner,
            create_failures: AtomicU32::new(times),
            finalize_failures: AtomicU32::new(0),
            fail_create_at: period_start,
            permanent,
        }
    }

    pub fn failing_finalize(inner: Arc<InMemoryStore>, times: u32) -> Self {
        Self {
            inner,
            create_failures: AtomicU32::new(0),
            finalize_failures: AtomicU32::new(times),
            fail_create_at: None,
            permanent: false,
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn failure(&self, operation: &str) -> AppError {
        if self.permanent {
            AppError::BadRequest(anyhow::anyhow!("{} rejected", operation))
        } else {
            AppError::ServiceUnavailable(format!("{} unavailable", operation))
        }
    }
}

#[async_trait]
impl InvoiceStore for FlakyInvoiceStore {
    async fn create_invoice(&self, draft: &DraftInvoice) -> Result<Invoice, AppError> {
        let targeted = self
            .fail_create_at
            .map_or(true, |start| start == draft.period_start);
        if targeted && Self::take(&self.create_failures) {
            return Err(self.failure("create_invoice"));
        }
        self.inner.create_invoice(draft).await
    }

    async fn finalize_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        if Self::take(&self.finalize_failures) {
            return Err(self.failure("finalize_invoice"));
        }
        self.inner.finalize_invoice(tenant_id, invoice_id).await
    }

    async fn get_invoice(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.get_invoice(tenant_id, invoice_id).await
    }

    async fn find_invoice_for_period(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
        period: BillingPeriod,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner
            .find_invoice_for_period(tenant_id, subscription_id, period)
            .await
    }

    async fn get_invoice_line_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineItem>, AppError> {
        self.inner.get_invoice_line_items(invoice_id).await
    }

    async fn mark_vendor_synced(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Invoice, AppError> {
        self.inner.mark_vendor_synced(tenant_id, invoice_id).await
    }

    async fn record_payment(
        &self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: PaymentStatus,
        amount_paid: Decimal,
    ) -> Result<Invoice, AppError> {
        self.inner
            .record_payment(tenant_id, invoice_id, status, amount_paid)
            .await
    }
}

/// Queue whose publish always fails.
pub struct BrokenQueue;

#[async_trait]
impl InvoiceQueue for BrokenQueue {
    async fn publish(&self, _event: &InvoiceEvent) -> Result<(), AppError> {
        Err(AppError::ServiceUnavailable("queue down".to_string()))
    }

    async fn receive(
        &self,
        _wait: Duration,
    ) -> Result<Option<subscription_billing::services::InvoiceDelivery>, AppError> {
        Ok(None)
    }

    async fn ack(
        &self,
        _delivery: &subscription_billing::services::InvoiceDelivery,
    ) -> Result<(), AppError> {
        Ok(())
    }

    async fn requeue(
        &self,
        _delivery: &subscription_billing::services::InvoiceDelivery,
    ) -> Result<(), AppError> {
        Err(AppError::ServiceUnavailable("queue down".to_string()))
    }
}

/// Enqueuer that records requests and rejects the listed subscriptions.
#[derive(Default)]
pub struct RecordingEnqueuer {
    pub requests: Mutex<Vec<CycleRequest>>,
    pub reject: HashSet<Uuid>,
    pub deduplicate: HashSet<Uuid>,
}

impl RecordingEnqueuer {
    pub async fn requested(&self) -> Vec<Uuid> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|request| request.subscription_id)
            .collect()
    }
}

#[async_trait]
impl CycleEnqueuer for RecordingEnqueuer {
    async fn enqueue(&self, request: CycleRequest) -> Result<EnqueueResult, AppError> {
        self.requests.lock().await.push(request);
        if self.reject.contains(&request.subscription_id) {
            return Err(AppError::ServiceUnavailable("cycle queue is full".to_string()));
        }
        if self.deduplicate.contains(&request.subscription_id) {
            return Ok(EnqueueResult::Deduplicated);
        }
        Ok(EnqueueResult::Enqueued)
    }
}

/// HTTP test application serving the admin router over the in-memory store.
pub struct TestApp {
    pub http_address: String,
    pub http_port: u16,
    pub store: Arc<InMemoryStore>,
    pub executor: Arc<CycleExecutor>,
    shutdown: CancellationToken,
}

impl TestApp {
    /// Spawn a new test application on a random port.
    pub async fn spawn() -> Self {
        init_metrics();

        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_store(store.clone());
        let calculator = Arc::new(LineItemPricer::new(stores.subscriptions.clone()));
        let orchestrator = Arc::new(BillingOrchestrator::from_stores(
            &stores,
            calculator,
            Arc::new(InMemoryInvoiceQueue::new()),
            fast_policy(),
        ));

        let shutdown = CancellationToken::new();
        let executor = Arc::new(CycleExecutor::start(
            orchestrator,
            ExecutorConfig::default(),
            shutdown.clone(),
        ));
        let scheduler = Arc::new(FleetScheduler::new(
            stores.subscriptions.clone(),
            stores.runs.clone(),
            executor.clone(),
            fast_policy(),
        ));

        let state = AppState {
            stores,
            scheduler,
            enqueuer: executor.clone(),
            default_batch_size: DEFAULT_BATCH_SIZE,
        };

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let http_port = listener.local_addr().unwrap().port();

        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(server_shutdown.cancelled_owned())
                .await
                .expect("Test server failed");
        });

        Self {
            http_address: format!("http://127.0.0.1:{}", http_port),
            http_port,
            store,
            executor,
            shutdown,
        }
    }

    /// Stop the server and the cycle workers.
    pub async fn cleanup(self) {
        self.shutdown.cancel();
        self.executor.join().await;
    }
}

/// Configuration for a fully wired application on in-memory backends.
pub fn memory_config() -> BillingConfig {
    BillingConfig {
        common: CoreConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            environment: "test".to_string(),
        },
        service_name: "subscription-billing".to_string(),
        service_version: "test".to_string(),
        log_level: "info".to_string(),
        otlp_endpoint: None,
        store: StoreBackend::Memory,
        database: None,
        scheduler: SchedulerConfig {
            enabled: true,
            interval: Duration::from_secs(3600),
            batch_size: DEFAULT_BATCH_SIZE,
        },
        executor: ExecutorSettings {
            worker_count: 2,
            queue_size: 100,
            cycle_timeout: Duration::from_secs(60),
        },
        retry: RetryConfig {
            internal: fast_policy(),
            external: fast_policy(),
        },
        invoice_queue: InvoiceQueueConfig {
            backend: QueueBackend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            key: "billing:test-invoice-events".to_string(),
            worker_count: 1,
        },
        vendors: VendorConfig {
            payment_gateway_url: None,
            vendor_sync_url: None,
            request_timeout: Duration::from_secs(5),
        },
    }
}

/// Build the full application and run it in the background; returns its
/// base URL.
pub async fn spawn_application() -> String {
    let app = Application::build(memory_config())
        .await
        .expect("Failed to build application");
    let port = app.port();
    tokio::spawn(app.run_until_stopped());
    format!("http://127.0.0.1:{}", port)
}
