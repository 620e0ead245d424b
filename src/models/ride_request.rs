use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DriverId, RideId, RideRequestId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideRequestStatus {
    Pending,
    Success,
    Cancelled,
}

impl fmt::Display for RideRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RideRequestStatus::Pending => "pending",
            RideRequestStatus::Success => "success",
            RideRequestStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub id: RideRequestId,
    pub ride_id: RideId,
    pub driver_id: DriverId,
    pub status: RideRequestStatus,
    // 0-based
    pub round: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
