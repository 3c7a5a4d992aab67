//! Downstream invoice processing: finalize, vendor sync, payment.

mod common;

use async_trait::async_trait;
use common::{at, fast_policy, monthly_subscription, tenant_id, TestContext};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use subscription_billing::models::{
    DraftInvoice, DraftLineItem, Invoice, InvoiceEvent, InvoiceLineItem, InvoiceStatus,
    PaymentStatus,
};
use subscription_billing::services::{InvoiceStore, PaymentAttempt, PaymentGateway, VendorSync};
use subscription_billing::workers::{InvoiceProcessor, PaymentOutcome};
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
struct Charge {
    invoice_id: Uuid,
    payment_method_id: String,
    amount: Decimal,
    idempotency_key: String,
}

struct FakeGateway {
    decline: bool,
    charges: Mutex<Vec<Charge>>,
}

impl FakeGateway {
    fn approving() -> Self {
        Self {
            decline: false,
            charges: Mutex::new(Vec::new()),
        }
    }

    fn declining() -> Self {
        Self {
            decline: true,
            charges: Mutex::new(Vec::new()),
        }
    }

    fn charges(&self) -> Vec<Charge> {
        self.charges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn attempt_payment(
        &self,
        invoice: &Invoice,
        payment_method_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<PaymentAttempt, AppError> {
        self.charges.lock().unwrap().push(Charge {
            invoice_id: invoice.invoice_id,
            payment_method_id: payment_method_id.to_string(),
            amount,
            idempotency_key: idempotency_key.to_string(),
        });
        if self.decline {
            return Ok(PaymentAttempt {
                succeeded: false,
                amount: Decimal::ZERO,
                gateway_reference: None,
                failure_reason: Some("card_declined".to_string()),
            });
        }
        Ok(PaymentAttempt {
            succeeded: true,
            amount,
            gateway_reference: Some(format!("ch_{}", invoice.invoice_id.simple())),
            failure_reason: None,
        })
    }
}

struct FakeVendor {
    failures: AtomicU32,
    permanent: bool,
    synced: Mutex<Vec<(Uuid, usize)>>,
}

impl FakeVendor {
    fn healthy() -> Self {
        Self::failing(0, false)
    }

    fn failing(times: u32, permanent: bool) -> Self {
        Self {
            failures: AtomicU32::new(times),
            permanent,
            synced: Mutex::new(Vec::new()),
        }
    }

    fn synced(&self) -> Vec<(Uuid, usize)> {
        self.synced.lock().unwrap().clone()
    }
}

#[async_trait]
impl VendorSync for FakeVendor {
    async fn sync_invoice(
        &self,
        invoice: &Invoice,
        line_items: &[InvoiceLineItem],
    ) -> Result<(), AppError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.permanent {
                AppError::BadRequest(anyhow::anyhow!("vendor rejected invoice"))
            } else {
                AppError::BadGateway("vendor returned 503".to_string())
            });
        }
        self.synced
            .lock()
            .unwrap()
            .push((invoice.invoice_id, line_items.len()));
        Ok(())
    }
}

fn processor(
    ctx: &TestContext,
    vendor: Arc<FakeVendor>,
    gateway: Arc<FakeGateway>,
) -> Arc<InvoiceProcessor> {
    Arc::new(InvoiceProcessor::new(
        ctx.stores.invoices.clone(),
        ctx.stores.subscriptions.clone(),
        vendor,
        gateway,
        fast_policy(),
    ))
}

/// Bill one period and return the event the cycle published for it.
async fn billed_invoice(ctx: &TestContext) -> InvoiceEvent {
    let sub = ctx.seed(monthly_subscription()).await;
    ctx.orchestrator
        .run_cycle(tenant_id(), sub.subscription_id, at(2024, 2, 15))
        .await
        .unwrap();
    ctx.queue.published().await.remove(0)
}

async fn invoice(ctx: &TestContext, invoice_id: Uuid) -> Invoice {
    ctx.stores
        .invoices
        .get_invoice(tenant_id(), invoice_id)
        .await
        .unwrap()
        .expect("invoice should exist")
}

#[tokio::test]
async fn finalized_invoice_is_synced_and_paid() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let vendor = Arc::new(FakeVendor::healthy());
    let gateway = Arc::new(FakeGateway::approving());

    let report = assert_ok!(
        processor(&ctx, vendor.clone(), gateway.clone())
            .process_invoice(&event)
            .await
    );

    assert!(report.vendor_synced);
    assert_eq!(
        report.payment,
        PaymentOutcome::Succeeded {
            amount: Decimal::new(9990, 2),
            gateway_reference: Some(format!("ch_{}", event.invoice_id.simple())),
        }
    );
    assert_eq!(vendor.synced(), vec![(event.invoice_id, 1)]);
    assert_eq!(
        gateway.charges(),
        vec![Charge {
            invoice_id: event.invoice_id,
            payment_method_id: "pm_test_visa".to_string(),
            amount: Decimal::new(9990, 2),
            idempotency_key: format!("invoice-payment-{}", event.invoice_id),
        }]
    );

    let stored = invoice(&ctx, event.invoice_id).await;
    assert_eq!(stored.payment_status(), PaymentStatus::Succeeded);
    assert_eq!(stored.amount_paid, Decimal::new(9990, 2));
    assert!(stored.vendor_synced_utc.is_some());
}

#[tokio::test]
async fn redelivered_event_does_not_sync_or_charge_twice() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let vendor = Arc::new(FakeVendor::healthy());
    let gateway = Arc::new(FakeGateway::approving());
    let processor = processor(&ctx, vendor.clone(), gateway.clone());

    assert_ok!(processor.process_invoice(&event).await);
    let second = assert_ok!(processor.process_invoice(&event).await);

    assert!(!second.vendor_synced);
    assert_eq!(second.payment, PaymentOutcome::AlreadyPaid);
    assert_eq!(vendor.synced().len(), 1);
    assert_eq!(gateway.charges().len(), 1);
}

#[tokio::test]
async fn missing_payment_method_is_rejected_after_vendor_sync() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let mut sub = ctx.subscription(event.subscription_id).await;
    sub.payment_method_id = None;
    ctx.store.insert_subscription(sub).await;

    let vendor = Arc::new(FakeVendor::healthy());
    let gateway = Arc::new(FakeGateway::approving());
    let err = assert_err!(
        processor(&ctx, vendor.clone(), gateway.clone())
            .process_invoice(&event)
            .await
    );

    assert_eq!(err.kind(), "validation");
    assert_eq!(vendor.synced().len(), 1);
    assert!(gateway.charges().is_empty());
    assert_eq!(
        invoice(&ctx, event.invoice_id).await.payment_status(),
        PaymentStatus::Pending
    );
}

#[tokio::test]
async fn declined_payment_is_recorded_as_failed() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let gateway = Arc::new(FakeGateway::declining());

    let report = assert_ok!(
        processor(&ctx, Arc::new(FakeVendor::healthy()), gateway.clone())
            .process_invoice(&event)
            .await
    );

    assert_eq!(
        report.payment,
        PaymentOutcome::Declined {
            reason: Some("card_declined".to_string()),
        }
    );
    let stored = invoice(&ctx, event.invoice_id).await;
    assert_eq!(stored.payment_status(), PaymentStatus::Failed);
    assert_eq!(stored.amount_paid, Decimal::ZERO);
    assert_eq!(stored.amount_remaining(), Decimal::new(9990, 2));
}

#[tokio::test]
async fn draft_invoice_is_finalized_before_processing() {
    let ctx = TestContext::new();
    let sub = ctx.seed(monthly_subscription()).await;
    let draft = ctx
        .stores
        .invoices
        .create_invoice(&DraftInvoice {
            tenant_id: sub.tenant_id,
            environment_id: sub.environment_id,
            subscription_id: sub.subscription_id,
            customer_id: sub.customer_id,
            currency: sub.currency.clone(),
            period_start: at(2024, 1, 1),
            period_end: at(2024, 2, 1),
            line_items: vec![DraftLineItem {
                price_id: None,
                description: "Setup".to_string(),
                quantity: Decimal::ONE,
                unit_amount: Decimal::new(2500, 2),
                amount: Decimal::new(2500, 2),
            }],
        })
        .await
        .unwrap();
    assert_eq!(draft.status(), InvoiceStatus::Draft);

    let report = assert_ok!(
        processor(
            &ctx,
            Arc::new(FakeVendor::healthy()),
            Arc::new(FakeGateway::approving()),
        )
        .process_invoice(&InvoiceEvent::for_invoice(&draft))
        .await
    );

    assert!(matches!(report.payment, PaymentOutcome::Succeeded { .. }));
    let stored = invoice(&ctx, draft.invoice_id).await;
    assert_eq!(stored.status(), InvoiceStatus::Finalized);
    assert_eq!(stored.invoice_number.as_deref(), Some("INV-000001"));
}

#[tokio::test]
async fn settled_invoice_needs_no_payment() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    ctx.stores
        .invoices
        .record_payment(
            tenant_id(),
            event.invoice_id,
            PaymentStatus::Pending,
            Decimal::new(9990, 2),
        )
        .await
        .unwrap();
    let gateway = Arc::new(FakeGateway::approving());

    let report = assert_ok!(
        processor(&ctx, Arc::new(FakeVendor::healthy()), gateway.clone())
            .process_invoice(&event)
            .await
    );

    assert_eq!(report.payment, PaymentOutcome::NothingDue);
    assert!(gateway.charges().is_empty());
}

#[tokio::test]
async fn transient_vendor_failures_are_retried() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let vendor = Arc::new(FakeVendor::failing(2, false));

    let report = assert_ok!(
        processor(&ctx, vendor.clone(), Arc::new(FakeGateway::approving()))
            .process_invoice(&event)
            .await
    );

    assert!(report.vendor_synced);
    assert_eq!(vendor.synced().len(), 1);
}

#[tokio::test]
async fn permanent_vendor_failure_stops_before_payment() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let gateway = Arc::new(FakeGateway::approving());

    let err = assert_err!(
        processor(&ctx, Arc::new(FakeVendor::failing(1, true)), gateway.clone())
            .process_invoice(&event)
            .await
    );

    assert_eq!(err.kind(), "validation");
    assert!(gateway.charges().is_empty());
    assert!(invoice(&ctx, event.invoice_id)
        .await
        .vendor_synced_utc
        .is_none());
}

#[tokio::test]
async fn unknown_invoice_is_not_found() {
    let ctx = TestContext::new();
    let event = InvoiceEvent {
        invoice_id: Uuid::new_v4(),
        subscription_id: Uuid::new_v4(),
        tenant_id: tenant_id(),
        environment_id: Uuid::new_v4(),
    };

    let err = assert_err!(
        processor(
            &ctx,
            Arc::new(FakeVendor::healthy()),
            Arc::new(FakeGateway::approving()),
        )
        .process_invoice(&event)
        .await
    );
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn workers_drain_the_invoice_queue() {
    let ctx = TestContext::new();
    let sub = ctx.seed(monthly_subscription()).await;
    let outcome = ctx
        .orchestrator
        .run_cycle(tenant_id(), sub.subscription_id, at(2024, 4, 15))
        .await
        .unwrap();
    assert_eq!(outcome.trigger.triggered_count, 3);

    let gateway = Arc::new(FakeGateway::approving());
    let shutdown = CancellationToken::new();
    let workers = processor(&ctx, Arc::new(FakeVendor::healthy()), gateway.clone())
        .spawn_workers(ctx.queue.clone(), 2, shutdown.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.charges().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("workers should charge every invoice");

    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    for invoice_id in outcome.invoice_ids {
        let stored = invoice(&ctx, invoice_id).await;
        assert!(stored.vendor_synced_utc.is_some());
        assert_eq!(stored.payment_status(), PaymentStatus::Succeeded);
    }
}

#[tokio::test]
async fn transient_failure_is_redelivered_until_it_succeeds() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    // Outlasts the three attempts of one delivery.
    let vendor = Arc::new(FakeVendor::failing(4, false));
    let gateway = Arc::new(FakeGateway::approving());
    let shutdown = CancellationToken::new();
    let workers = processor(&ctx, vendor.clone(), gateway.clone())
        .spawn_workers(ctx.queue.clone(), 1, shutdown.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.charges().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("redelivered event should be charged");

    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    assert_eq!(ctx.queue.requeued().await, vec![event.clone()]);
    assert_eq!(vendor.synced(), vec![(event.invoice_id, 1)]);
    assert_eq!(gateway.charges().len(), 1);
    let stored = invoice(&ctx, event.invoice_id).await;
    assert_eq!(stored.payment_status(), PaymentStatus::Succeeded);
}

#[tokio::test]
async fn permanent_failure_is_not_redelivered() {
    let ctx = TestContext::new();
    let event = billed_invoice(&ctx).await;
    let vendor = Arc::new(FakeVendor::failing(1, true));
    let gateway = Arc::new(FakeGateway::approving());
    let shutdown = CancellationToken::new();
    let workers = processor(&ctx, vendor.clone(), gateway.clone())
        .spawn_workers(ctx.queue.clone(), 1, shutdown.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    for worker in workers {
        worker.await.unwrap();
    }

    assert!(ctx.queue.requeued().await.is_empty());
    assert!(vendor.synced().is_empty());
    assert!(gateway.charges().is_empty());
    assert!(invoice(&ctx, event.invoice_id).await.vendor_synced_utc.is_none());
}
