use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::config::EnvelopeStyle;
use crate::markets::ValidationError;

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: &'static str,
    pub message: &'static str,
    pub timestamp: DateTime<Utc>,
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markets_count: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

/// Serialize `value` in the configured envelope.
pub fn respond<T: Serialize>(style: EnvelopeStyle, status: StatusCode, value: T) -> Response {
    match style {
        EnvelopeStyle::Data => (status, Json(Envelope { data: value })).into_response(),
        EnvelopeStyle::Bare => (status, Json(value)).into_response(),
    }
}

/// Pull the market payload out of a creation request body.
///
/// An empty body, a non-object body (wrapped style) or a missing `data` key all
/// mean "no data"; the service turns that into a validation error.
pub fn extract_payload(style: EnvelopeStyle, body: &[u8]) -> Result<Option<Value>, ValidationError> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    let value: Value = serde_json::from_slice(body).map_err(|_| ValidationError::InvalidJson)?;

    Ok(match style {
        EnvelopeStyle::Data => match value {
            Value::Object(mut map) => map.remove("data"),
            _ => None,
        },
        EnvelopeStyle::Bare => Some(value),
    })
}
