use std::cell::Cell;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::driver::GeoPoint;
use crate::models::ride::{Ride, RideStatus};
use crate::models::{DriverId, RideId, RiderId};
use crate::store::{Conditional, RideFilter, RideStore};

const ALL_STATUSES: [RideStatus; 5] = [
    RideStatus::Pending,
    RideStatus::Running,
    RideStatus::Completed,
    RideStatus::Rejected,
    RideStatus::Cancelled,
];

#[derive(Debug, Clone)]
pub struct Cancellation {
    pub ride: Ride,
    pub released_driver: Option<DriverId>,
}

pub struct RideStateMachine {
    store: Arc<dyn RideStore>,
}

impl RideStateMachine {
    pub fn new(store: Arc<dyn RideStore>) -> Self {
        Self { store }
    }

    pub fn create_ride(
        &self,
        rider_id: RiderId,
        pickup: Option<GeoPoint>,
        dropoff: Option<GeoPoint>,
    ) -> Result<Ride, AppError> {
        let pickup = pickup.ok_or_else(|| AppError::InvalidLocation("pickup is required".to_string()))?;
        if !pickup.is_valid() {
            return Err(AppError::InvalidLocation(format!(
                "pickup out of range: lat={}, lng={}",
                pickup.lat, pickup.lng
            )));
        }
        if let Some(dropoff) = dropoff.filter(|point| !point.is_valid()) {
            return Err(AppError::InvalidLocation(format!(
                "dropoff out of range: lat={}, lng={}",
                dropoff.lat, dropoff.lng
            )));
        }

        let now = Utc::now();
        let ride = Ride {
            id: Uuid::new_v4(),
            rider_id,
            driver_id: None,
            pickup,
            dropoff,
            status: RideStatus::Pending,
            review: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_ride(ride.clone())?;

        info!(ride_id = %ride.id, rider_id = %rider_id, "ride created");
        Ok(ride)
    }

    pub fn ride(&self, ride_id: RideId) -> Result<Ride, AppError> {
        self.store
            .ride(ride_id)?
            .ok_or(AppError::RideNotFound(ride_id))
    }

    pub fn rides(&self, filter: &RideFilter) -> Result<Vec<Ride>, AppError> {
        Ok(self.store.rides(filter)?)
    }

    // Of any number of concurrent callers for one ride, exactly one succeeds.
    pub fn assign(&self, ride_id: RideId, driver_id: DriverId) -> Result<Ride, AppError> {
        let ride = self.transition(ride_id, RideStatus::Running, &|ride: &mut Ride| {
            ride.driver_id = Some(driver_id);
        })?;

        info!(ride_id = %ride_id, driver_id = %driver_id, "ride assigned");
        Ok(ride)
    }

    /// Undoes `assign` while the ride is still running with `driver_id`.
    pub fn revert_assignment(&self, ride_id: RideId, driver_id: DriverId) -> Result<Ride, AppError> {
        let outcome = self.store.update_ride_if(ride_id, &[RideStatus::Running], &|ride: &mut Ride| {
            if ride.driver_id == Some(driver_id) {
                ride.status = RideStatus::Pending;
                ride.driver_id = None;
            }
        })?;

        match outcome {
            Conditional::Applied(ride) if ride.status == RideStatus::Pending => {
                info!(ride_id = %ride_id, driver_id = %driver_id, "assignment reverted");
                Ok(ride)
            }
            Conditional::Applied(ride) | Conditional::Mismatch(ride) => {
                Err(AppError::ride_transition(ride.status, RideStatus::Pending))
            }
            Conditional::Missing => Err(AppError::RideNotFound(ride_id)),
        }
    }

    pub fn complete_ride(&self, ride_id: RideId, review: Option<String>) -> Result<Ride, AppError> {
        let ride = self.transition(ride_id, RideStatus::Completed, &|ride: &mut Ride| {
            if review.is_some() {
                ride.review = review.clone();
            }
        })?;

        info!(ride_id = %ride_id, "ride completed");
        Ok(ride)
    }

    pub fn cancel_ride(&self, ride_id: RideId) -> Result<Cancellation, AppError> {
        let released = Cell::new(None);
        let ride = self.transition(ride_id, RideStatus::Cancelled, &|ride: &mut Ride| {
            released.set(ride.driver_id.take());
        })?;

        info!(ride_id = %ride_id, "ride cancelled");
        Ok(Cancellation {
            ride,
            released_driver: released.get(),
        })
    }

    pub fn reject_ride(&self, ride_id: RideId) -> Result<Ride, AppError> {
        let ride = self.transition(ride_id, RideStatus::Rejected, &|_: &mut Ride| {})?;

        info!(ride_id = %ride_id, "ride rejected");
        Ok(ride)
    }

    fn transition(
        &self,
        ride_id: RideId,
        to: RideStatus,
        update: &dyn Fn(&mut Ride),
    ) -> Result<Ride, AppError> {
        let expected: Vec<RideStatus> = ALL_STATUSES
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect();

        let outcome = self.store.update_ride_if(ride_id, &expected, &|ride: &mut Ride| {
            ride.status = to;
            update(ride);
        })?;

        match outcome {
            Conditional::Applied(ride) => Ok(ride),
            Conditional::Mismatch(ride) => Err(AppError::ride_transition(ride.status, to)),
            Conditional::Missing => Err(AppError::RideNotFound(ride_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use uuid::Uuid;

    use super::RideStateMachine;
    use crate::error::AppError;
    use crate::models::driver::GeoPoint;
    use crate::models::ride::{Ride, RideStatus};
    use crate::models::ride_request::{RideRequest, RideRequestStatus};
    use crate::models::{RideId, RideRequestId};
    use crate::store::{
        Conditional, InMemoryRideStore, RideFilter, RideRequestFilter, RideStore, StoreError,
        StoreResult,
    };

    fn machine() -> RideStateMachine {
        RideStateMachine::new(Arc::new(InMemoryRideStore::new()))
    }

    fn pending_ride(machine: &RideStateMachine) -> Ride {
        machine
            .create_ride(
                Uuid::new_v4(),
                Some(GeoPoint::new(12.34, 56.78)),
                Some(GeoPoint::new(34.56, 78.12)),
            )
            .unwrap()
    }

    #[test]
    fn new_ride_is_pending_without_driver() {
        let machine = machine();
        let ride = pending_ride(&machine);
        assert_eq!(ride.status, RideStatus::Pending);
        assert!(ride.driver_id.is_none());
        assert_eq!(machine.ride(ride.id).unwrap().id, ride.id);
    }

    #[test]
    fn missing_or_malformed_pickup_is_invalid_location() {
        let machine = machine();
        let rider = Uuid::new_v4();
        assert!(matches!(
            machine.create_ride(rider, None, None),
            Err(AppError::InvalidLocation(_))
        ));
        assert!(matches!(
            machine.create_ride(rider, Some(GeoPoint::new(95.0, 0.0)), None),
            Err(AppError::InvalidLocation(_))
        ));
        assert!(matches!(
            machine.create_ride(
                rider,
                Some(GeoPoint::new(1.0, 1.0)),
                Some(GeoPoint::new(0.0, f64::NAN))
            ),
            Err(AppError::InvalidLocation(_))
        ));
        assert!(machine.rides(&RideFilter::default()).unwrap().is_empty());
    }

    #[test]
    fn assign_then_complete_keeps_driver_and_review() {
        let machine = machine();
        let ride = pending_ride(&machine);
        let driver = Uuid::new_v4();

        let running = machine.assign(ride.id, driver).unwrap();
        assert_eq!(running.status, RideStatus::Running);
        assert_eq!(running.driver_id, Some(driver));

        let completed = machine
            .complete_ride(ride.id, Some("smooth ride".to_string()))
            .unwrap();
        assert_eq!(completed.status, RideStatus::Completed);
        assert_eq!(completed.driver_id, Some(driver));
        assert_eq!(completed.review.as_deref(), Some("smooth ride"));
    }

    #[test]
    fn revert_assignment_only_undoes_the_named_driver() {
        let machine = machine();
        let ride = pending_ride(&machine);
        let driver = Uuid::new_v4();
        machine.assign(ride.id, driver).unwrap();

        let err = machine.revert_assignment(ride.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(machine.ride(ride.id).unwrap().driver_id, Some(driver));

        let reverted = machine.revert_assignment(ride.id, driver).unwrap();
        assert_eq!(reverted.status, RideStatus::Pending);
        assert_eq!(reverted.driver_id, None);

        assert!(machine.revert_assignment(ride.id, driver).is_err());
        assert_eq!(machine.assign(ride.id, driver).unwrap().status, RideStatus::Running);
    }

    #[test]
    fn second_assign_is_an_invalid_transition() {
        let machine = machine();
        let ride = pending_ride(&machine);
        let winner = Uuid::new_v4();
        machine.assign(ride.id, winner).unwrap();

        let err = machine.assign(ride.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition { .. }));
        assert_eq!(machine.ride(ride.id).unwrap().driver_id, Some(winner));
    }

    #[test]
    fn unknown_ride_is_not_found() {
        let machine = machine();
        assert!(matches!(
            machine.assign(Uuid::new_v4(), Uuid::new_v4()),
            Err(AppError::RideNotFound(_))
        ));
    }

    #[test]
    fn lifecycle_rules_are_enforced() {
        let machine = machine();

        let ride = pending_ride(&machine);
        assert!(machine.complete_ride(ride.id, None).is_err());
        machine.reject_ride(ride.id).unwrap();
        assert!(machine.cancel_ride(ride.id).is_err());
        assert!(machine.assign(ride.id, Uuid::new_v4()).is_err());

        let ride = pending_ride(&machine);
        machine.assign(ride.id, Uuid::new_v4()).unwrap();
        assert!(machine.reject_ride(ride.id).is_err());

        let ride = pending_ride(&machine);
        let cancelled = machine.cancel_ride(ride.id).unwrap();
        assert_eq!(cancelled.ride.status, RideStatus::Cancelled);
        assert!(cancelled.released_driver.is_none());
        assert!(machine.complete_ride(ride.id, None).is_err());
    }

    #[test]
    fn cancelling_a_running_ride_releases_the_driver() {
        let machine = machine();
        let ride = pending_ride(&machine);
        let driver = Uuid::new_v4();
        machine.assign(ride.id, driver).unwrap();

        let cancelled = machine.cancel_ride(ride.id).unwrap();
        assert_eq!(cancelled.released_driver, Some(driver));
        assert!(cancelled.ride.driver_id.is_none());
    }

    #[test]
    fn concurrent_assign_has_exactly_one_winner() {
        let machine = Arc::new(machine());
        let ride = pending_ride(&machine);
        let ride_id = ride.id;

        let results: Vec<(Uuid, bool)> = thread::scope(|scope| {
            let handles: Vec<_> = (0..16u128)
                .map(|n| {
                    let machine = machine.clone();
                    scope.spawn(move || {
                        let driver = Uuid::from_u128(n + 1);
                        (driver, machine.assign(ride_id, driver).is_ok())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let winners: Vec<Uuid> = results
            .iter()
            .filter(|(_, won)| *won)
            .map(|(driver, _)| *driver)
            .collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(machine.ride(ride_id).unwrap().driver_id, Some(winners[0]));
    }

    /// Delegates reads and inserts but fails every conditional write.
    struct UnavailableOnWrite(InMemoryRideStore);

    impl RideStore for UnavailableOnWrite {
        fn insert_ride(&self, ride: Ride) -> StoreResult<()> {
            self.0.insert_ride(ride)
        }
        fn ride(&self, id: RideId) -> StoreResult<Option<Ride>> {
            self.0.ride(id)
        }
        fn rides(&self, filter: &RideFilter) -> StoreResult<Vec<Ride>> {
            self.0.rides(filter)
        }
        fn update_ride_if(
            &self,
            _id: RideId,
            _expected: &[RideStatus],
            _update: &dyn Fn(&mut Ride),
        ) -> StoreResult<Conditional<Ride>> {
            Err(StoreError::Unavailable("write path down".to_string()))
        }
        fn insert_request(&self, request: RideRequest) -> StoreResult<()> {
            self.0.insert_request(request)
        }
        fn request(&self, id: RideRequestId) -> StoreResult<Option<RideRequest>> {
            self.0.request(id)
        }
        fn requests(&self, filter: &RideRequestFilter) -> StoreResult<Vec<RideRequest>> {
            self.0.requests(filter)
        }
        fn update_request_if(
            &self,
            _id: RideRequestId,
            _expected: RideRequestStatus,
            _next: RideRequestStatus,
        ) -> StoreResult<Conditional<RideRequest>> {
            Err(StoreError::Unavailable("write path down".to_string()))
        }
    }

    #[test]
    fn store_failure_during_assign_leaves_ride_untouched() {
        let machine = RideStateMachine::new(Arc::new(UnavailableOnWrite(InMemoryRideStore::new())));
        let ride = pending_ride(&machine);

        let err = machine.assign(ride.id, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, AppError::Store(StoreError::Unavailable(_))));

        let stored = machine.ride(ride.id).unwrap();
        assert_eq!(stored.status, RideStatus::Pending);
        assert!(stored.driver_id.is_none());
    }
}
