//! Fleet scheduler tests.

mod common;

use chrono::{DateTime, Utc};
use common::{at, fast_policy, monthly_subscription, pause_for, RecordingEnqueuer, TestContext};
use std::collections::HashSet;
use std::sync::Arc;
use subscription_billing::engine::{FleetScheduler, DEFAULT_BATCH_SIZE};
use subscription_billing::models::{
    BillingRunStatus, BillingRunType, PauseMode, PauseStatus, Subscription, SubscriptionStatus,
};
use subscription_billing::services::BillingRunStore;
use uuid::Uuid;

fn scheduler(ctx: &TestContext, enqueuer: Arc<RecordingEnqueuer>) -> FleetScheduler {
    FleetScheduler::new(
        ctx.stores.subscriptions.clone(),
        ctx.stores.runs.clone(),
        enqueuer,
        fast_policy(),
    )
}

async fn seed_due(ctx: &TestContext, count: usize) -> Vec<Uuid> {
    let mut ids = Vec::new();
    for _ in 0..count {
        let sub = ctx.seed(monthly_subscription()).await;
        ids.push(sub.subscription_id);
    }
    ids.sort();
    ids
}

async fn seed_variant(ctx: &TestContext, change: impl FnOnce(&mut Subscription)) -> Uuid {
    let mut sub = monthly_subscription();
    change(&mut sub);
    ctx.seed(sub).await.subscription_id
}

#[tokio::test]
async fn run_pages_through_every_due_subscription() {
    let ctx = TestContext::new();
    let due = seed_due(&ctx, 5).await;
    seed_variant(&ctx, |sub| {
        sub.current_period_start = at(2099, 12, 1);
        sub.current_period_end = at(2100, 1, 1);
    })
    .await;
    seed_variant(&ctx, |sub| sub.published = false).await;
    seed_variant(&ctx, |sub| sub.set_status(SubscriptionStatus::Draft)).await;
    seed_variant(&ctx, |sub| sub.set_status(SubscriptionStatus::Cancelled)).await;

    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let run = scheduler(&ctx, enqueuer.clone())
        .run_once(BillingRunType::Scheduled, 2)
        .await
        .expect("run should complete");

    assert_eq!(run.status(), BillingRunStatus::Completed);
    assert_eq!(run.run_type, "scheduled");
    assert_eq!(run.batch_size, 2);
    assert_eq!(run.subscriptions_scanned, 5);
    assert_eq!(run.subscriptions_enqueued, 5);
    assert_eq!(run.subscriptions_failed, 0);
    assert!(run.completed_utc.is_some());

    assert_eq!(enqueuer.requested().await, due);
}

#[tokio::test]
async fn enqueue_failures_are_recorded_and_the_run_continues() {
    let ctx = TestContext::new();
    let due = seed_due(&ctx, 3).await;

    let enqueuer = Arc::new(RecordingEnqueuer {
        reject: HashSet::from([due[1]]),
        ..Default::default()
    });
    let run = scheduler(&ctx, enqueuer.clone())
        .run_once(BillingRunType::Manual, 10)
        .await
        .unwrap();

    assert_eq!(run.status(), BillingRunStatus::Completed);
    assert_eq!(run.subscriptions_scanned, 3);
    assert_eq!(run.subscriptions_enqueued, 2);
    assert_eq!(run.subscriptions_failed, 1);
    assert_eq!(enqueuer.requested().await, due);

    let results = ctx
        .stores
        .runs
        .get_billing_run_results(run.run_id)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].subscription_id, due[1]);
    assert_eq!(results[0].status, "failed");
    assert!(results[0]
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("cycle queue is full")));
}

#[tokio::test]
async fn deduplicated_enqueues_are_counted_separately() {
    let ctx = TestContext::new();
    let due = seed_due(&ctx, 2).await;

    let enqueuer = Arc::new(RecordingEnqueuer {
        deduplicate: HashSet::from([due[0]]),
        ..Default::default()
    });
    let run = scheduler(&ctx, enqueuer)
        .run_once(BillingRunType::Scheduled, 10)
        .await
        .unwrap();

    assert_eq!(run.subscriptions_enqueued, 1);
    assert_eq!(run.subscriptions_deduplicated, 1);
    assert_eq!(run.subscriptions_failed, 0);
}

#[tokio::test]
async fn non_positive_batch_size_uses_default() {
    let ctx = TestContext::new();
    seed_due(&ctx, 1).await;

    let run = scheduler(&ctx, Arc::new(RecordingEnqueuer::default()))
        .run_once(BillingRunType::Manual, 0)
        .await
        .unwrap();

    assert_eq!(i64::from(run.batch_size), DEFAULT_BATCH_SIZE);
    assert_eq!(run.subscriptions_enqueued, 1);
}

/// Not-yet-due subscription carrying a pause record.
async fn seed_with_pause(
    ctx: &TestContext,
    status: SubscriptionStatus,
    summary: PauseStatus,
    pause_status: PauseStatus,
    pause_start: DateTime<Utc>,
    pause_end: Option<DateTime<Utc>>,
) -> Uuid {
    let mut sub = monthly_subscription();
    sub.current_period_start = at(2099, 12, 1);
    sub.current_period_end = at(2100, 1, 1);
    sub.set_status(status);
    sub.set_pause_status(summary);
    let pause = pause_for(&sub, PauseMode::Scheduled, pause_status, pause_start, pause_end);
    sub.active_pause_id = Some(pause.pause_id);
    ctx.store.insert_pause(pause).await;
    ctx.seed(sub).await.subscription_id
}

#[tokio::test]
async fn pauses_are_scanned_once_a_transition_is_due() {
    let ctx = TestContext::new();
    let resume_due = seed_with_pause(
        &ctx,
        SubscriptionStatus::Paused,
        PauseStatus::Active,
        PauseStatus::Active,
        at(2024, 2, 10),
        Some(at(2024, 2, 20)),
    )
    .await;
    let activation_due = seed_with_pause(
        &ctx,
        SubscriptionStatus::Active,
        PauseStatus::Scheduled,
        PauseStatus::Scheduled,
        at(2024, 2, 10),
        None,
    )
    .await;
    // Open-ended pause, pause ending in the future, pause starting in the future.
    seed_with_pause(
        &ctx,
        SubscriptionStatus::Paused,
        PauseStatus::Active,
        PauseStatus::Active,
        at(2024, 2, 10),
        None,
    )
    .await;
    seed_with_pause(
        &ctx,
        SubscriptionStatus::Paused,
        PauseStatus::Active,
        PauseStatus::Active,
        at(2024, 2, 10),
        Some(at(2099, 6, 1)),
    )
    .await;
    seed_with_pause(
        &ctx,
        SubscriptionStatus::Active,
        PauseStatus::Scheduled,
        PauseStatus::Scheduled,
        at(2099, 6, 1),
        None,
    )
    .await;
    seed_variant(&ctx, |sub| {
        sub.set_status(SubscriptionStatus::Paused);
        sub.set_pause_status(PauseStatus::None);
    })
    .await;

    let enqueuer = Arc::new(RecordingEnqueuer::default());
    let run = scheduler(&ctx, enqueuer.clone())
        .run_once(BillingRunType::Scheduled, 10)
        .await
        .unwrap();

    let mut expected = vec![resume_due, activation_due];
    expected.sort();
    assert_eq!(run.subscriptions_scanned, 2);
    assert_eq!(enqueuer.requested().await, expected);
}

#[tokio::test]
async fn finished_run_is_persisted() {
    let ctx = TestContext::new();
    seed_due(&ctx, 2).await;

    let run = scheduler(&ctx, Arc::new(RecordingEnqueuer::default()))
        .run_once(BillingRunType::Manual, 1)
        .await
        .unwrap();

    let stored = ctx
        .stores
        .runs
        .get_billing_run(run.run_id)
        .await
        .unwrap()
        .expect("run should be stored");
    assert_eq!(stored, run);
    assert_eq!(stored.subscriptions_scanned, 2);
    assert_eq!(stored.run_type, "manual");
}

#[tokio::test]
async fn empty_fleet_completes_with_zero_counts() {
    let ctx = TestContext::new();
    let enqueuer = Arc::new(RecordingEnqueuer::default());

    let run = scheduler(&ctx, enqueuer.clone())
        .run_once(BillingRunType::Scheduled, 10)
        .await
        .unwrap();

    assert_eq!(run.status(), BillingRunStatus::Completed);
    assert_eq!(run.subscriptions_scanned, 0);
    assert!(enqueuer.requested().await.is_empty());
}
