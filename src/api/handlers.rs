use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::Utc;

use super::error::ApiError;
use super::models::{extract_payload, respond, HealthStatus, ServiceStatus};
use super::AppState;
use crate::markets::MarketId;

pub async fn root(State(state): State<AppState>) -> Json<ServiceStatus> {
    // The count is informational; a failing store still answers liveness.
    let markets_count = state.service.count().await.ok();

    Json(ServiceStatus {
        status: "ok",
        message: "Prediction Markets API is running",
        timestamp: Utc::now(),
        backend: state.service.backend(),
        markets_count,
    })
}

pub async fn health() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

pub async fn list_markets(State(state): State<AppState>) -> Result<Response, ApiError> {
    let markets = state
        .service
        .list_all()
        .await
        .map_err(|e| ApiError::from_service(e, "Failed to fetch prediction markets"))?;

    Ok(respond(state.envelope, StatusCode::OK, markets))
}

pub async fn get_market(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let market = state
        .service
        .get_one(&MarketId::new(id))
        .await
        .map_err(|e| ApiError::from_service(e, "Failed to fetch prediction market"))?;

    Ok(respond(state.envelope, StatusCode::OK, market))
}

pub async fn create_market(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let payload = extract_payload(state.envelope, &body)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let market = state
        .service
        .create(payload)
        .await
        .map_err(|e| ApiError::from_service(e, "Failed to create prediction market"))?;

    Ok(respond(state.envelope, StatusCode::CREATED, market))
}
