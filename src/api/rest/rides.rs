use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::{GeoPoint, NearbyDriver};
use crate::models::ride::{Ride, RideStatus};
use crate::state::AppState;
use crate::store::RideFilter;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(request_ride).get(list_rides))
        .route("/rides/:id", get(get_ride).patch(update_ride))
}

#[derive(Deserialize)]
pub struct CreateRideRequest {
    pub rider_id: Uuid,
    pub pickup: Option<GeoPoint>,
    pub dropoff: Option<GeoPoint>,
}

#[derive(Serialize)]
pub struct CreateRideResponse {
    pub ride_id: Uuid,
    pub status: RideStatus,
    pub ride: Ride,
    pub notified_drivers: Vec<NearbyDriver>,
}

#[derive(Deserialize)]
pub struct ListRidesQuery {
    pub rider_id: Option<Uuid>,
    pub status: Option<RideStatus>,
}

#[derive(Deserialize)]
pub struct UpdateRideRequest {
    pub status: RideStatus,
    pub review: Option<String>,
}

async fn request_ride(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRideRequest>,
) -> Result<(StatusCode, Json<CreateRideResponse>), AppError> {
    let dispatch = state
        .dispatcher
        .request_ride(payload.rider_id, payload.pickup, payload.dropoff)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateRideResponse {
            ride_id: dispatch.ride.id,
            status: dispatch.ride.status,
            ride: dispatch.ride,
            notified_drivers: dispatch.notified_drivers,
        }),
    ))
}

async fn list_rides(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRidesQuery>,
) -> Result<Json<Vec<Ride>>, AppError> {
    let rides = state.rides.rides(&RideFilter {
        rider_id: query.rider_id,
        status: query.status,
    })?;
    Ok(Json(rides))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, AppError> {
    Ok(Json(state.rides.ride(id)?))
}

async fn update_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateRideRequest>,
) -> Result<Json<Ride>, AppError> {
    if payload.review.is_some() && payload.status != RideStatus::Completed {
        return Err(AppError::BadRequest(
            "review is only accepted when completing a ride".to_string(),
        ));
    }

    let ride = match payload.status {
        RideStatus::Completed => state.dispatcher.complete_ride(id, payload.review)?,
        RideStatus::Cancelled => state.dispatcher.cancel_ride(id)?,
        RideStatus::Rejected => state.dispatcher.reject_ride(id)?,
        other => {
            return Err(AppError::BadRequest(format!(
                "status {other} cannot be set directly"
            )));
        }
    };
    Ok(Json(ride))
}
