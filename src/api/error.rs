use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::markets::ServiceError;

pub const NOT_FOUND_MESSAGE: &str = "Prediction market not found";
pub const CONFLICT_MESSAGE: &str = "Prediction market already exists";

/// HTTP-facing error. Storage details are logged by the service and never
/// reach the response body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{}", NOT_FOUND_MESSAGE)]
    NotFound,

    #[error("{}", CONFLICT_MESSAGE)]
    Conflict,

    #[error("{0}")]
    Internal(&'static str),
}

impl ApiError {
    /// Map a service failure, using `failure` as the public message for
    /// storage errors.
    pub fn from_service(err: ServiceError, failure: &'static str) -> Self {
        match err {
            ServiceError::Validation(e) => ApiError::BadRequest(e.to_string()),
            ServiceError::NotFound(_) => ApiError::NotFound,
            ServiceError::Conflict(_) => ApiError::Conflict,
            ServiceError::Storage(_) => ApiError::Internal(failure),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (code, Json(ErrBody { error: self.to_string() })).into_response()
    }
}
