use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;
use crate::models::AccountAddress;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub session: String,
    pub account: Option<AccountAddress>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let session = state.session.status();

    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment.clone(),
        session: session.state.label().to_string(),
        account: session.state.account(),
    })
}
