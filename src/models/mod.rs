pub mod driver;
pub mod event;
pub mod ride;
pub mod ride_request;

use uuid::Uuid;

pub type DriverId = Uuid;
pub type RiderId = Uuid;
pub type RideId = Uuid;
pub type RideRequestId = Uuid;
pub type LocationRecordId = Uuid;
