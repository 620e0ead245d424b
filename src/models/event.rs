use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DriverId, RideId, RideRequestId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    RideOffered {
        ride_id: RideId,
        round: u32,
        drivers: Vec<DriverId>,
        at: DateTime<Utc>,
    },
    RideAssigned {
        ride_id: RideId,
        driver_id: DriverId,
        request_id: RideRequestId,
        at: DateTime<Utc>,
    },
    RideRejected {
        ride_id: RideId,
        at: DateTime<Utc>,
    },
    RideCancelled {
        ride_id: RideId,
        at: DateTime<Utc>,
    },
    RideCompleted {
        ride_id: RideId,
        driver_id: Option<DriverId>,
        at: DateTime<Utc>,
    },
}

impl DispatchEvent {
    pub fn ride_id(&self) -> RideId {
        match self {
            Self::RideOffered { ride_id, .. }
            | Self::RideAssigned { ride_id, .. }
            | Self::RideRejected { ride_id, .. }
            | Self::RideCancelled { ride_id, .. }
            | Self::RideCompleted { ride_id, .. } => *ride_id,
        }
    }

    pub fn concerns_driver(&self, driver_id: DriverId) -> bool {
        match self {
            Self::RideOffered { drivers, .. } => drivers.contains(&driver_id),
            Self::RideAssigned { driver_id: assigned, .. } => *assigned == driver_id,
            Self::RideCompleted { driver_id: assigned, .. } => *assigned == Some(driver_id),
            Self::RideRejected { .. } | Self::RideCancelled { .. } => false,
        }
    }
}
