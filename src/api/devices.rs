//! Device endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::Serialize;

use super::ApiState;
use crate::devices::{Device, ProvisionFields};
use crate::{Error, Result};

/// Response to an admin device registration
#[derive(Debug, Serialize)]
pub struct ProvisionResponse {
    pub status: &'static str,
    pub device: Device,
}

/// Build device router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/devices", get(list_devices))
        .route("/devices/{identity}", get(get_device))
        .route("/register-device", post(register_device))
        .with_state(state)
}

async fn list_devices(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Device>>> {
    Ok(Json(state.gateway.presence().list().await?))
}

async fn get_device(
    State(state): State<Arc<ApiState>>,
    Path(identity): Path<String>,
) -> Result<Json<Device>> {
    state
        .gateway
        .presence()
        .get(&identity)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("device {identity}")))
}

async fn register_device(
    State(state): State<Arc<ApiState>>,
    Json(fields): Json<ProvisionFields>,
) -> Result<Json<ProvisionResponse>> {
    let device = state.gateway.presence().provision(fields).await?;
    tracing::info!(sensor_id = %device.sensor_id, "device provisioned");
    Ok(Json(ProvisionResponse {
        status: "success",
        device,
    }))
}
