use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::GeoPoint;
use crate::models::{DriverId, RideId, RiderId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Pending,
    Running,
    Completed,
    Rejected,
    Cancelled,
}

impl RideStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RideStatus::Completed | RideStatus::Rejected | RideStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: RideStatus) -> bool {
        matches!(
            (self, next),
            (RideStatus::Pending, RideStatus::Running)
                | (RideStatus::Pending, RideStatus::Rejected)
                | (RideStatus::Pending, RideStatus::Cancelled)
                | (RideStatus::Running, RideStatus::Completed)
                | (RideStatus::Running, RideStatus::Cancelled)
        )
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RideStatus::Pending => "pending",
            RideStatus::Running => "running",
            RideStatus::Completed => "completed",
            RideStatus::Rejected => "rejected",
            RideStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub rider_id: RiderId,
    pub driver_id: Option<DriverId>,
    pub pickup: GeoPoint,
    pub dropoff: Option<GeoPoint>,
    pub status: RideStatus,
    pub review: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
