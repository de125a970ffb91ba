use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::{
    error::{AppError, Result},
    models::{AccountAddress, ApiResponse, SessionStatus},
    services::ProviderEvent,
};

#[derive(Debug, Deserialize)]
pub struct AccountReportRequest {
    pub address: String,
}

#[derive(Debug, Deserialize)]
pub struct ProviderErrorRequest {
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct EventAcceptedResponse {
    pub event: &'static str,
}

async fn dispatch(
    state: &AppState,
    event: ProviderEvent,
    name: &'static str,
) -> Result<Json<ApiResponse<EventAcceptedResponse>>> {
    state.session.send(event).await?;
    Ok(Json(ApiResponse::success(EventAcceptedResponse { event: name })))
}

/// GET /api/v1/session/status
pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<SessionStatus>> {
    Json(ApiResponse::success(state.session.status()))
}

/// POST /api/v1/session/connect
pub async fn connect(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<EventAcceptedResponse>>> {
    dispatch(&state, ProviderEvent::ConnectRequested, "connect_requested").await
}

/// POST /api/v1/session/account
pub async fn report_account(
    State(state): State<AppState>,
    Json(req): Json<AccountReportRequest>,
) -> Result<Json<ApiResponse<EventAcceptedResponse>>> {
    let account = AccountAddress::parse(req.address.trim())?;
    dispatch(&state, ProviderEvent::AccountReported(account), "account_reported").await
}

/// POST /api/v1/session/disconnect
pub async fn disconnect(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<EventAcceptedResponse>>> {
    dispatch(&state, ProviderEvent::Disconnected, "disconnected").await
}

/// POST /api/v1/session/refresh
pub async fn refresh(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<EventAcceptedResponse>>> {
    dispatch(&state, ProviderEvent::RefreshRequested, "refresh_requested").await
}

/// POST /api/v1/session/error
pub async fn report_error(
    State(state): State<AppState>,
    Json(req): Json<ProviderErrorRequest>,
) -> Result<Json<ApiResponse<EventAcceptedResponse>>> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(AppError::BadRequest("Error reason is required".to_string()));
    }
    dispatch(
        &state,
        ProviderEvent::ProviderError(reason.to_string()),
        "provider_error",
    )
    .await
}
