use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// One token balance query exhausted its retries. Absorbed into the snapshot.
    #[error("Balance query failed for {symbol}: {reason}")]
    QueryFailed { symbol: String, reason: String },

    /// The native balance query exhausted its retries. Aborts the pipeline run.
    #[error("Native balance query failed: {0}")]
    MandatoryQueryFailed(String),

    #[error("Backend rejected snapshot: {0}")]
    SyncRejected(String),

    #[error("Transient sync failure: {0}")]
    SyncTransient(String),

    #[error("Superseded by a newer snapshot")]
    Superseded,

    #[error("Blockchain RPC error: {0}")]
    BlockchainRPC(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Wallet session is closed")]
    SessionClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether another attempt of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::BlockchainRPC(_) | AppError::SyncTransient(_) | AppError::QueryFailed { .. }
        )
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            AppError::InvalidAddress(_) => (StatusCode::BAD_REQUEST, "INVALID_ADDRESS"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::SessionClosed => (StatusCode::SERVICE_UNAVAILABLE, "SESSION_CLOSED"),
            AppError::BlockchainRPC(_)
            | AppError::QueryFailed { .. }
            | AppError::MandatoryQueryFailed(_) => (StatusCode::BAD_GATEWAY, "CHAIN_QUERY_FAILED"),
            AppError::SyncRejected(_) | AppError::SyncTransient(_) | AppError::Superseded => {
                (StatusCode::BAD_GATEWAY, "SYNC_FAILED")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ErrorResponse {
            success: false,
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        });

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
