use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::{DriverLocationRecord, GeoPoint, NearbyDriver};
use crate::models::DriverId;
use crate::state::AppState;
use crate::store::RideFilter;

const DEFAULT_NEARBY_LIMIT: usize = 10;
const MAX_NEARBY_LIMIT: usize = 100;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/driver-locations", post(report_location))
        .route("/driver-locations/:driver_id", patch(update_location))
        .route("/drivers/nearby", get(nearby_drivers))
}

#[derive(Deserialize)]
pub struct ReportLocationRequest {
    pub driver_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "available_by_default")]
    pub available: bool,
}

fn available_by_default() -> bool {
    true
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub available: Option<bool>,
}

#[derive(Serialize)]
pub struct LocationResponse {
    pub status: &'static str,
    pub location: DriverLocationRecord,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub rider_id: Option<Uuid>,
    pub k: Option<usize>,
    // comma-separated
    pub exclude: Option<String>,
}

async fn report_location(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ReportLocationRequest>,
) -> Result<Json<LocationResponse>, AppError> {
    let location = state.registry.report_location(
        payload.driver_id,
        payload.latitude,
        payload.longitude,
        payload.available,
    )?;
    Ok(Json(LocationResponse {
        status: "ok",
        location,
    }))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<LocationResponse>, AppError> {
    if payload.latitude.is_none() && payload.longitude.is_none() && payload.available.is_none() {
        return Err(AppError::BadRequest(
            "one of latitude, longitude or available is required".to_string(),
        ));
    }

    let location = state.registry.update_location(
        driver_id,
        payload.latitude,
        payload.longitude,
        payload.available,
    )?;
    Ok(Json(LocationResponse {
        status: "ok",
        location,
    }))
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, AppError> {
    let point = match (query.lat, query.lng, query.rider_id) {
        (Some(lat), Some(lng), _) => {
            let point = GeoPoint::new(lat, lng);
            if !point.is_valid() {
                return Err(AppError::InvalidCoordinate { lat, lng });
            }
            point
        }
        (None, None, Some(rider_id)) => latest_pickup(&state, rider_id)?,
        _ => {
            return Err(AppError::BadRequest(
                "lat and lng, or rider_id, are required".to_string(),
            ));
        }
    };

    let k = query
        .k
        .unwrap_or(DEFAULT_NEARBY_LIMIT)
        .min(MAX_NEARBY_LIMIT);
    let exclude = parse_exclude(query.exclude.as_deref())?;

    Ok(Json(state.registry.available_drivers_near(&point, k, &exclude)))
}

fn latest_pickup(state: &AppState, rider_id: Uuid) -> Result<GeoPoint, AppError> {
    let rides = state.rides.rides(&RideFilter {
        rider_id: Some(rider_id),
        status: None,
    })?;
    rides
        .last()
        .map(|ride| ride.pickup)
        .ok_or_else(|| AppError::BadRequest(format!("rider {rider_id} has no rides")))
}

fn parse_exclude(raw: Option<&str>) -> Result<HashSet<DriverId>, AppError> {
    let Some(raw) = raw else {
        return Ok(HashSet::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(|id| {
            Uuid::parse_str(id)
                .map_err(|err| AppError::BadRequest(format!("invalid driver id {id}: {err}")))
        })
        .collect()
}
