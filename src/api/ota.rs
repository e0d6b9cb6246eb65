//! OTA command endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde_json::Value;

use super::ApiState;
use crate::Result;
use crate::ota::{AckRecord, Command, CommandRequest};

/// Build OTA router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/send-command", post(send_command))
        .route("/ota-history", get(history))
        .route("/ota-status/{command_id}", get(status))
        .route("/ota-acks", get(acks))
        .with_state(state)
}

/// Dispatch a command; targets come from `targets.device_ids` or `sensor_id`
async fn send_command(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<Value>,
) -> Result<Json<Command>> {
    let request = CommandRequest::from_value(body)?;
    Ok(Json(state.gateway.dispatcher().send_command(request).await?))
}

async fn history(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Command>>> {
    Ok(Json(state.gateway.dispatcher().list().await?))
}

async fn status(
    State(state): State<Arc<ApiState>>,
    Path(command_id): Path<String>,
) -> Result<Json<Command>> {
    Ok(Json(state.gateway.dispatcher().get(&command_id).await?))
}

async fn acks(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<AckRecord>>> {
    Ok(Json(state.gateway.acks().list().await?))
}
