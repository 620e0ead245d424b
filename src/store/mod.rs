pub mod memory;

use thiserror::Error;

use crate::models::ride::{Ride, RideStatus};
use crate::models::ride_request::{RideRequest, RideRequestStatus};
use crate::models::{DriverId, RideId, RideRequestId, RiderId};

pub use memory::InMemoryRideStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub enum Conditional<T> {
    /// The record matched and now holds the returned value.
    Applied(T),
    /// The record exists but was not in an expected state; returned unchanged.
    Mismatch(T),
    Missing,
}

#[derive(Debug, Default, Clone)]
pub struct RideFilter {
    pub rider_id: Option<RiderId>,
    pub status: Option<RideStatus>,
}

impl RideFilter {
    pub fn matches(&self, ride: &Ride) -> bool {
        self.rider_id.is_none_or(|id| ride.rider_id == id)
            && self.status.is_none_or(|status| ride.status == status)
    }
}

#[derive(Debug, Default, Clone)]
pub struct RideRequestFilter {
    pub ride_id: Option<RideId>,
    pub driver_id: Option<DriverId>,
    pub status: Option<RideRequestStatus>,
}

impl RideRequestFilter {
    pub fn matches(&self, request: &RideRequest) -> bool {
        self.ride_id.is_none_or(|id| request.ride_id == id)
            && self.driver_id.is_none_or(|id| request.driver_id == id)
            && self.status.is_none_or(|status| request.status == status)
    }
}

pub trait RideStore: Send + Sync {
    fn insert_ride(&self, ride: Ride) -> StoreResult<()>;

    fn ride(&self, id: RideId) -> StoreResult<Option<Ride>>;

    // oldest first
    fn rides(&self, filter: &RideFilter) -> StoreResult<Vec<Ride>>;

    /// Applies `update` atomically iff the ride's status is in `expected`.
    fn update_ride_if(
        &self,
        id: RideId,
        expected: &[RideStatus],
        update: &dyn Fn(&mut Ride),
    ) -> StoreResult<Conditional<Ride>>;

    fn insert_request(&self, request: RideRequest) -> StoreResult<()>;

    fn request(&self, id: RideRequestId) -> StoreResult<Option<RideRequest>>;

    // oldest first
    fn requests(&self, filter: &RideRequestFilter) -> StoreResult<Vec<RideRequest>>;

    fn update_request_if(
        &self,
        id: RideRequestId,
        expected: RideRequestStatus,
        next: RideRequestStatus,
    ) -> StoreResult<Conditional<RideRequest>>;
}
