//! Shared test utilities

#![allow(dead_code)]

use ota_gateway::api::ApiServerBuilder;
use ota_gateway::{DeviceSession, Gateway, Outbound};
use serde_json::Value;
use tokio::sync::mpsc;

/// Build the full API router over `gateway`
#[must_use]
pub fn test_router(gateway: Gateway) -> axum::Router {
    ApiServerBuilder::new(gateway)
        .allowed_origins(vec!["http://localhost:3000".to_string()])
        .build()
        .router()
}

/// Open a session and register it as `sensor_id`, consuming the reply
pub async fn register(gateway: &Gateway, sensor_id: &str) -> (DeviceSession, mpsc::Receiver<Outbound>) {
    let (mut session, mut rx) = gateway.open_session();
    send(&mut session, serde_json::json!({"type": "register", "sensor_id": sensor_id})).await;
    assert_eq!(
        next(&mut rx),
        serde_json::json!({"status": "registered", "sensor_id": sensor_id})
    );
    (session, rx)
}

/// Feed a JSON frame to a session
pub async fn send(session: &mut DeviceSession, frame: Value) {
    session
        .handle_text(&frame.to_string())
        .await
        .expect("frame handling failed");
}

/// Next queued frame as JSON
pub fn next(rx: &mut mpsc::Receiver<Outbound>) -> Value {
    let frame = rx.try_recv().expect("expected a queued frame");
    serde_json::to_value(frame).expect("frame serializes")
}

/// Every queued frame as JSON
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::to_value(frame).expect("frame serializes"));
    }
    frames
}

/// Read a response body as JSON
pub async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
