use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DriverId, LocationRecordId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverLocationRecord {
    pub id: LocationRecordId,
    pub driver_id: DriverId,
    pub location: GeoPoint,
    pub available: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NearbyDriver {
    pub driver_id: DriverId,
    pub distance_km: f64,
}
