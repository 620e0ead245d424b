use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::ride::RideStatus;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid coordinate: lat={lat}, lng={lng}")]
    InvalidCoordinate { lat: f64, lng: f64 },

    #[error("invalid location: {0}")]
    InvalidLocation(String),

    #[error("ride {0} not found")]
    RideNotFound(Uuid),

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("ride request {0} not found")]
    RideRequestNotFound(Uuid),

    #[error("ride request {request_id} was not offered to driver {driver_id}")]
    NotOfferedToDriver { request_id: Uuid, driver_id: Uuid },

    #[error("driver {0} is already on a ride")]
    DriverBusy(Uuid),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("no drivers available")]
    NoDriversAvailable,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn ride_transition(from: RideStatus, to: RideStatus) -> Self {
        AppError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::InvalidCoordinate { .. }
            | AppError::InvalidLocation(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RideNotFound(_)
            | AppError::DriverNotFound(_)
            | AppError::RideRequestNotFound(_) => StatusCode::NOT_FOUND,
            AppError::NotOfferedToDriver { .. } => StatusCode::FORBIDDEN,
            AppError::InvalidTransition { .. } | AppError::DriverBusy(_) => StatusCode::CONFLICT,
            AppError::NoDriversAvailable | AppError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}
