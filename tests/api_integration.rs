//! Integration tests for the alert relay API endpoints.
//!
//! These tests verify the full request/response cycle through the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum_test::TestServer;
use serde_json::json;
use tokio::sync::Notify;
use tower::ServiceExt;

use alert_relay::analyzer::AlertAnalyzer;
use alert_relay::api::{AppState, router};
use alert_relay::config::{AnalyzerConfig, PriorityConfig, QueueConfig};
use alert_relay::distribution::Distributor;
use alert_relay::model::OrgHierarchyInfo;
use alert_relay::pipeline::AlertPipeline;
use alert_relay::priority::{NoGeoRisk, PriorityCalculator};
use alert_relay::queue::PriorityDeduplicatingQueue;
use alert_relay::storage::Storage;

fn member(user_id: &str, depth: u32, principal: bool) -> OrgHierarchyInfo {
    OrgHierarchyInfo {
        user_id: user_id.to_string(),
        org_id: format!("site-{}", depth),
        org_name: format!("Site level {}", depth),
        depth,
        principal,
        phone: Some("+15550000000".to_string()),
        email: Some(format!("{}@example.org", user_id)),
        user_name: user_id.to_string(),
    }
}

async fn create_test_state() -> AppState {
    let storage = Arc::new(Storage::new("sqlite::memory:").await.unwrap());
    storage
        .upsert_member("site-0", &member("carer-1", 0, false))
        .await
        .unwrap();
    storage
        .upsert_member("site-0", &member("carer-2", 0, false))
        .await
        .unwrap();
    storage
        .upsert_member("site-0", &member("manager", 1, true))
        .await
        .unwrap();

    let queue = Arc::new(PriorityDeduplicatingQueue::new(QueueConfig::default()));
    let distributor = Distributor::new(queue, storage.clone(), Arc::new(Notify::new()));
    let pipeline = AlertPipeline::new(
        AlertAnalyzer::neutral(AnalyzerConfig::default()),
        PriorityCalculator::new(Arc::new(NoGeoRisk), PriorityConfig::default()),
        distributor,
        storage,
        Duration::from_secs(1),
    );

    AppState::new(pipeline)
}

async fn create_test_server() -> TestServer {
    TestServer::new(router(create_test_state().await)).unwrap()
}

fn alert_body(alert_id: &str, org_id: &str) -> serde_json::Value {
    json!({
        "alert_id": alert_id,
        "alert_type": "FALL_DETECTION",
        "device_sn": "DEV-0001",
        "timestamp": "2024-03-05T23:30:00Z",
        "description": "Fall detected in bathroom",
        "severity": "CRITICAL",
        "user_id": "resident-9",
        "org_id": org_id
    })
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = create_test_server().await;

    let response = server.get("/health").await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_post_alert_queues_tasks() {
    let server = create_test_server().await;

    let response = server.post("/alerts").json(&alert_body("a-1", "site-0")).await;

    response.assert_status(StatusCode::ACCEPTED);

    let body: serde_json::Value = response.json();
    assert_eq!(body["analyzed"]["alert_id"], "a-1");
    assert_eq!(body["distribution"]["total_recipients"], 3);
    assert_eq!(body["distribution"]["admitted_tasks"], 3);
    assert_eq!(body["priority"]["escalation_chain"][0]["manager_ids"][0], "manager");
    let priority = body["priority"]["priority"].as_u64().unwrap();
    assert!((1..=10).contains(&priority));
}

#[tokio::test]
async fn test_duplicate_alert_is_suppressed() {
    let server = create_test_server().await;

    server
        .post("/alerts")
        .json(&alert_body("a-2", "site-0"))
        .await
        .assert_status(StatusCode::ACCEPTED);
    let response = server.post("/alerts").json(&alert_body("a-2", "site-0")).await;

    response.assert_status(StatusCode::ACCEPTED);
    let body: serde_json::Value = response.json();
    assert_eq!(body["distribution"]["admitted_tasks"], 0);

    let stats: serde_json::Value = server.get("/queue/stats").await.json();
    assert_eq!(stats["total_length"], 3);
    assert_eq!(stats["duplicate_count"], 3);
}

#[tokio::test]
async fn test_unknown_org_is_conflict_with_error_body() {
    let server = create_test_server().await;

    let response = server
        .post("/alerts")
        .json(&alert_body("a-3", "no-such-site"))
        .await;

    response.assert_status(StatusCode::CONFLICT);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"], "no_recipients");

    let stats: serde_json::Value = server.get("/queue/stats").await.json();
    assert_eq!(stats["total_length"], 0);
}

#[tokio::test]
async fn test_unknown_severity_is_accepted() {
    let server = create_test_server().await;

    let mut body = alert_body("a-4", "site-0");
    body["severity"] = json!("SEVERE");

    let response = server.post("/alerts").json(&body).await;

    response.assert_status(StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_queue_stats_lanes() {
    let server = create_test_server().await;

    let response = server.get("/queue/stats").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["per_lane_length"].as_array().unwrap().len(), 10);
    assert_eq!(body["processed_count"], 0);
}

#[tokio::test]
async fn test_cleanup_keeps_fresh_entries() {
    let server = create_test_server().await;

    server
        .post("/alerts")
        .json(&alert_body("a-5", "site-0"))
        .await
        .assert_status(StatusCode::ACCEPTED);

    let response = server.post("/queue/cleanup").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["evicted"], 0);
    assert_eq!(body["remaining"], 3);
}

#[tokio::test]
async fn test_router_oneshot_rejects_malformed_json() {
    let app = router(create_test_state().await);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/alerts")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"alert_type": "SOS"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
