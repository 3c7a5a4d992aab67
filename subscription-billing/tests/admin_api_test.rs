//! Admin HTTP API integration tests: billing runs and manual processing.

mod common;

use common::{monthly_subscription, tenant_id, TestApp};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
async fn manual_billing_run_scans_due_subscriptions() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let first = monthly_subscription();
    let second = monthly_subscription();
    app.store.insert_subscription(first.clone()).await;
    app.store.insert_subscription(second.clone()).await;

    let response = client
        .post(&format!("{}/v1/billing/runs", app.http_address))
        .json(&json!({}))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::OK);
    let run: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(run["status"], "completed");
    assert_eq!(run["run_type"], "manual");
    assert_eq!(run["batch_size"], 100);
    assert_eq!(run["subscriptions_scanned"], 2);
    assert_eq!(
        run["subscriptions_enqueued"].as_i64().unwrap()
            + run["subscriptions_deduplicated"].as_i64().unwrap(),
        2
    );

    let run_id = run["run_id"].as_str().unwrap();
    let response = client
        .get(&format!("{}/v1/billing/runs/{}", app.http_address, run_id))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["run"]["run_id"], run_id);
    assert_eq!(body["results"], json!([]));

    app.cleanup().await;
}

#[tokio::test]
async fn billing_run_honours_requested_batch_size() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    for _ in 0..3 {
        app.store.insert_subscription(monthly_subscription()).await;
    }

    let run: Value = client
        .post(&format!("{}/v1/billing/runs", app.http_address))
        .json(&json!({ "batch_size": 2 }))
        .send()
        .await
        .expect("Failed to execute request")
        .json()
        .await
        .expect("Failed to parse JSON");

    assert_eq!(run["batch_size"], 2);
    assert_eq!(run["subscriptions_scanned"], 3);

    app.cleanup().await;
}

#[tokio::test]
async fn out_of_range_batch_size_is_rejected() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .post(&format!("{}/v1/billing/runs", app.http_address))
        .json(&json!({ "batch_size": 0 }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    app.cleanup().await;
}

#[tokio::test]
async fn unknown_billing_run_returns_404() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .get(&format!(
            "{}/v1/billing/runs/{}",
            app.http_address,
            Uuid::new_v4()
        ))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await;
}

#[tokio::test]
async fn process_unknown_subscription_returns_404() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .post(&format!(
            "{}/v1/billing/subscriptions/{}/{}/process",
            app.http_address,
            tenant_id(),
            Uuid::new_v4()
        ))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.cleanup().await;
}

#[tokio::test]
async fn process_subscription_enqueues_a_cycle() {
    let app = TestApp::spawn().await;
    let client = Client::new();
    let sub = monthly_subscription();
    app.store
        .insert_line_item(common::line_item(&sub, 1, 4900))
        .await;
    app.store.insert_subscription(sub.clone()).await;

    let response = client
        .post(&format!(
            "{}/v1/billing/subscriptions/{}/{}/process",
            app.http_address, sub.tenant_id, sub.subscription_id
        ))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["subscription_id"], sub.subscription_id.to_string());
    assert_eq!(body["result"], "enqueued");

    tokio::time::timeout(Duration::from_secs(5), async {
        while app.executor.is_in_flight(sub.subscription_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cycle should finish");

    let invoices = app.store.invoices_for_subscription(sub.subscription_id).await;
    assert!(!invoices.is_empty());
    assert!(invoices.iter().all(|invoice| invoice.is_finalized()));

    app.cleanup().await;
}

#[tokio::test]
async fn metrics_reflect_billing_runs() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    client
        .post(&format!("{}/v1/billing/runs", app.http_address))
        .json(&json!({}))
        .send()
        .await
        .expect("Failed to execute request");

    let body = client
        .get(&format!("{}/metrics", app.http_address))
        .send()
        .await
        .expect("Failed to execute request")
        .text()
        .await
        .expect("Failed to read body");

    assert!(body.contains("billing_runs_total"));

    app.cleanup().await;
}
