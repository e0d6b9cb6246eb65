//! HTTP API server for the OTA gateway

pub mod devices;
pub mod health;
pub mod ota;
pub mod websocket;

use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::DEFAULT_PORT;
use crate::gateway::Gateway;
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub gateway: Gateway,
}

/// Error body returned by every endpoint
#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            Self::Validation(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(what) => (StatusCode::NOT_FOUND, format!("{what} not found")),
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    gateway: Gateway,
    port: u16,
    allowed_origins: Vec<String>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
        }
    }

    /// Set the port to listen on
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the origins allowed by CORS
    #[must_use]
    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            state: Arc::new(ApiState {
                gateway: self.gateway,
            }),
            port: self.port,
            allowed_origins: self.allowed_origins,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    allowed_origins: Vec<String>,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .merge(devices::router(self.state.clone()))
            .merge(ota::router(self.state.clone()))
            .merge(websocket::router(self.state.clone()))
            .merge(health::router());

        // CORS layer for the admin UI
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        axum::serve(listener, self.router())
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
