use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::dispatch::RespondOutcome;
use crate::error::AppError;
use crate::models::ride_request::{RideRequest, RideRequestStatus};
use crate::state::AppState;
use crate::store::RideRequestFilter;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ride-requests", get(list_ride_requests))
        .route(
            "/ride-requests/:id",
            get(get_ride_request).patch(respond_to_ride_request),
        )
}

#[derive(Deserialize)]
pub struct ListRideRequestsQuery {
    pub driver_id: Option<Uuid>,
    pub ride_id: Option<Uuid>,
    pub status: Option<RideRequestStatus>,
}

#[derive(Deserialize)]
pub struct RespondRequest {
    pub driver_id: Uuid,
    pub accept: bool,
}

#[derive(Serialize)]
pub struct RespondResponse {
    pub status: RespondOutcome,
}

async fn list_ride_requests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRideRequestsQuery>,
) -> Result<Json<Vec<RideRequest>>, AppError> {
    let requests = state.dispatcher.requests(&RideRequestFilter {
        ride_id: query.ride_id,
        driver_id: query.driver_id,
        status: query.status,
    })?;
    Ok(Json(requests))
}

async fn get_ride_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatcher.request(id)?))
}

async fn respond_to_ride_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<RespondResponse>, AppError> {
    let status = state
        .dispatcher
        .respond_to_request(id, payload.driver_id, payload.accept)
        .await?;
    Ok(Json(RespondResponse { status }))
}
