//! Gateway-level error types, with conversions into HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use anova_protocol::ProtocolError;

/// Errors that can occur while operating a single appliance connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    Closed,

    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Top-level gateway errors surfaced to HTTP handlers and background tasks.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("no BLE appliance found")]
    BleDeviceNotFound,

    #[error("bluetooth error: {0}")]
    Bluetooth(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::DeviceNotFound(_) | GatewayError::BleDeviceNotFound => StatusCode::NOT_FOUND,
            GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Connection(ConnectionError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Connection(_) | GatewayError::Bluetooth(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
