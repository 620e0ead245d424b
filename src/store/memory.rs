use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::models::ride::{Ride, RideStatus};
use crate::models::ride_request::{RideRequest, RideRequestStatus};
use crate::models::{RideId, RideRequestId};
use crate::store::{
    Conditional, RideFilter, RideRequestFilter, RideStore, StoreError, StoreResult,
};

// Conditional updates run under the write guard of the record's shard.
#[derive(Default)]
pub struct InMemoryRideStore {
    rides: DashMap<RideId, Ride>,
    requests: DashMap<RideRequestId, RideRequest>,
    requests_by_ride: DashMap<RideId, Vec<RideRequestId>>,
}

impl InMemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ride_count(&self) -> usize {
        self.rides.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }
}

impl RideStore for InMemoryRideStore {
    fn insert_ride(&self, ride: Ride) -> StoreResult<()> {
        match self.rides.entry(ride.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("ride {}", ride.id))),
            Entry::Vacant(vacant) => {
                vacant.insert(ride);
                Ok(())
            }
        }
    }

    fn ride(&self, id: RideId) -> StoreResult<Option<Ride>> {
        Ok(self.rides.get(&id).map(|ride| ride.value().clone()))
    }

    fn rides(&self, filter: &RideFilter) -> StoreResult<Vec<Ride>> {
        let mut rides: Vec<Ride> = self
            .rides
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rides.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rides)
    }

    fn update_ride_if(
        &self,
        id: RideId,
        expected: &[RideStatus],
        update: &dyn Fn(&mut Ride),
    ) -> StoreResult<Conditional<Ride>> {
        let Some(mut ride) = self.rides.get_mut(&id) else {
            return Ok(Conditional::Missing);
        };
        if !expected.contains(&ride.status) {
            return Ok(Conditional::Mismatch(ride.clone()));
        }

        update(ride.value_mut());
        ride.updated_at = Utc::now();
        Ok(Conditional::Applied(ride.clone()))
    }

    fn insert_request(&self, request: RideRequest) -> StoreResult<()> {
        let (id, ride_id) = (request.id, request.ride_id);
        match self.requests.entry(id) {
            Entry::Occupied(_) => {
                return Err(StoreError::Duplicate(format!("ride request {id}")));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(request);
            }
        }
        self.requests_by_ride.entry(ride_id).or_default().push(id);
        Ok(())
    }

    fn request(&self, id: RideRequestId) -> StoreResult<Option<RideRequest>> {
        Ok(self.requests.get(&id).map(|request| request.value().clone()))
    }

    fn requests(&self, filter: &RideRequestFilter) -> StoreResult<Vec<RideRequest>> {
        let mut requests: Vec<RideRequest> = match filter.ride_id {
            Some(ride_id) => {
                let ids = self
                    .requests_by_ride
                    .get(&ride_id)
                    .map(|ids| ids.clone())
                    .unwrap_or_default();
                ids.iter()
                    .filter_map(|id| self.requests.get(id).map(|r| r.value().clone()))
                    .filter(|request| filter.matches(request))
                    .collect()
            }
            None => self
                .requests
                .iter()
                .filter(|entry| filter.matches(entry.value()))
                .map(|entry| entry.value().clone())
                .collect(),
        };
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }

    fn update_request_if(
        &self,
        id: RideRequestId,
        expected: RideRequestStatus,
        next: RideRequestStatus,
    ) -> StoreResult<Conditional<RideRequest>> {
        let Some(mut request) = self.requests.get_mut(&id) else {
            return Ok(Conditional::Missing);
        };
        if request.status != expected {
            return Ok(Conditional::Mismatch(request.clone()));
        }

        request.status = next;
        request.updated_at = Utc::now();
        Ok(Conditional::Applied(request.clone()))
    }
}
