//! HTTP dispatcher tests against a local gateway.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{Json, Router, extract::State, http::StatusCode, routing::post};
use chrono::Utc;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use alert_relay::dispatch::{ChannelDispatcher, HttpDispatcher};
use alert_relay::error::PipelineError;
use alert_relay::model::{
    AlertSnapshot, AlertType, Channel, NotificationTask, RecipientSnapshot, RecipientType,
    Severity, TaskStatus,
};

fn task(recipient_id: &str, priority: u8) -> NotificationTask {
    let now = Utc::now();
    NotificationTask {
        task_id: Uuid::new_v4(),
        alert_id: "alert-http".to_string(),
        recipient_id: recipient_id.to_string(),
        recipient_type: RecipientType::Manager,
        priority,
        channels: vec![Channel::Sms, Channel::Im, Channel::Email],
        delivery_deadline: now,
        escalation_delay_minutes: 5,
        alert: AlertSnapshot {
            alert_type: AlertType::Sos,
            severity: Severity::Critical,
            device_sn: "DEV-9".to_string(),
            description: "SOS pressed".to_string(),
            timestamp: now,
            recommended_actions: vec!["Call the resident".to_string()],
        },
        recipient: RecipientSnapshot {
            user_name: recipient_id.to_string(),
            org_id: "org".to_string(),
            org_name: "Org".to_string(),
            depth: 1,
            phone: Some("+15550001111".to_string()),
            email: None,
        },
        created_at: now,
        status: TaskStatus::Pending,
        retry_count: 0,
        metadata: BTreeMap::new(),
    }
}

async fn accept(State(tx): State<mpsc::UnboundedSender<Value>>, Json(body): Json<Value>) -> StatusCode {
    let _ = tx.send(body);
    StatusCode::ACCEPTED
}

async fn reject() -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn spawn_gateway() -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/notify", post(accept))
        .route("/down", post(reject))
        .with_state(tx);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, rx)
}

#[tokio::test]
async fn test_batch_posted_as_json() {
    let (addr, mut rx) = spawn_gateway().await;
    let dispatcher = HttpDispatcher::new(&format!("http://{}/notify", addr));

    dispatcher
        .schedule_notifications(&[task("lead", 1), task("deputy", 2)])
        .await
        .unwrap();

    let body = rx.recv().await.unwrap();
    let tasks = body["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["recipient_id"], "lead");
    assert_eq!(tasks[0]["channels"][0], "SMS");
    assert_eq!(tasks[1]["priority"], 2);
}

#[tokio::test]
async fn test_gateway_error_status_is_dispatch_error() {
    let (addr, _rx) = spawn_gateway().await;
    let dispatcher = HttpDispatcher::new(&format!("http://{}/down", addr));

    let err = dispatcher
        .schedule_notifications(&[task("lead", 1)])
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Dispatch(_)));
}
