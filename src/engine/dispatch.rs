use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::engine::queue::{enqueue_round, OfferRound};
use crate::engine::registry::DriverRegistry;
use crate::engine::rides::RideStateMachine;
use crate::error::AppError;
use crate::models::driver::{GeoPoint, NearbyDriver};
use crate::models::event::DispatchEvent;
use crate::models::ride::{Ride, RideStatus};
use crate::models::ride_request::{RideRequest, RideRequestStatus};
use crate::models::{DriverId, RideId, RideRequestId, RiderId};
use crate::observability::metrics::Metrics;
use crate::store::{Conditional, RideRequestFilter, RideStore};

#[derive(Debug, Clone)]
pub struct RideDispatch {
    pub ride: Ride,
    pub notified_drivers: Vec<NearbyDriver>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RespondOutcome {
    Success,
    AlreadyAssigned,
    Cancelled,
}

enum FollowUp {
    Nothing,
    Schedule(OfferRound),
    Assigned {
        ride: Ride,
        driver_id: DriverId,
        request_id: RideRequestId,
    },
}

pub struct DispatchCoordinator {
    registry: Arc<DriverRegistry>,
    rides: Arc<RideStateMachine>,
    store: Arc<dyn RideStore>,
    config: DispatchConfig,
    // Only rides still pending keep an entry.
    ride_locks: DashMap<RideId, Arc<Mutex<()>>>,
    // driver -> ride they are committed to
    active_rides: DashMap<DriverId, RideId>,
    offer_tx: mpsc::Sender<OfferRound>,
    events_tx: broadcast::Sender<DispatchEvent>,
    metrics: Metrics,
}

impl DispatchCoordinator {
    pub fn new(
        registry: Arc<DriverRegistry>,
        rides: Arc<RideStateMachine>,
        store: Arc<dyn RideStore>,
        config: DispatchConfig,
        offer_tx: mpsc::Sender<OfferRound>,
        events_tx: broadcast::Sender<DispatchEvent>,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            rides,
            store,
            config,
            ride_locks: DashMap::new(),
            active_rides: DashMap::new(),
            offer_tx,
            events_tx,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn ride(&self, ride_id: RideId) -> Result<Ride, AppError> {
        self.rides.ride(ride_id)
    }

    pub fn request(&self, request_id: RideRequestId) -> Result<RideRequest, AppError> {
        self.store
            .request(request_id)?
            .ok_or(AppError::RideRequestNotFound(request_id))
    }

    pub fn requests(&self, filter: &RideRequestFilter) -> Result<Vec<RideRequest>, AppError> {
        Ok(self.store.requests(filter)?)
    }

    pub async fn request_ride(
        &self,
        rider_id: RiderId,
        pickup: Option<GeoPoint>,
        dropoff: Option<GeoPoint>,
    ) -> Result<RideDispatch, AppError> {
        let ride = self.rides.create_ride(rider_id, pickup, dropoff)?;
        self.metrics.rides_requested_total.inc();

        let opened = self.locked(ride.id, || {
            match self.open_round(&ride, 0, &HashSet::new()) {
                Ok(opened) => Ok(Some(opened)),
                Err(AppError::NoDriversAvailable) => self.reject_unserved(ride.id).map(|_| None),
                Err(err) => Err(err),
            }
        })?;

        match opened {
            Some((offer, notified_drivers)) => {
                enqueue_round(&self.offer_tx, &self.metrics, offer).await?;
                Ok(RideDispatch {
                    ride,
                    notified_drivers,
                })
            }
            None => Ok(RideDispatch {
                ride: self.rides.ride(ride.id)?,
                notified_drivers: Vec::new(),
            }),
        }
    }

    pub async fn respond_to_request(
        &self,
        request_id: RideRequestId,
        driver_id: DriverId,
        accept: bool,
    ) -> Result<RespondOutcome, AppError> {
        let request = self.request(request_id)?;
        if request.driver_id != driver_id {
            return Err(AppError::NotOfferedToDriver {
                request_id,
                driver_id,
            });
        }

        let (outcome, follow_up) = self.locked(request.ride_id, || {
            if accept {
                self.accept(request_id, request.ride_id, driver_id)
            } else {
                self.decline(request_id, request.ride_id)
            }
        })?;

        let label = match outcome {
            RespondOutcome::Success => "success",
            RespondOutcome::AlreadyAssigned => "already_assigned",
            RespondOutcome::Cancelled => "declined",
        };
        self.metrics
            .dispatch_responses_total
            .with_label_values(&[label])
            .inc();

        self.follow_up(follow_up).await?;
        Ok(outcome)
    }

    // Offers of `round` still pending count as rejected.
    pub async fn expire_round(&self, ride_id: RideId, round: u32) -> Result<(), AppError> {
        if self.rides.ride(ride_id)?.status != RideStatus::Pending {
            return Ok(());
        }

        let follow_up = self.locked(ride_id, || {
            if self.rides.ride(ride_id)?.status != RideStatus::Pending {
                return Ok(FollowUp::Nothing);
            }

            let stale = self.store.requests(&RideRequestFilter {
                ride_id: Some(ride_id),
                status: Some(RideRequestStatus::Pending),
                ..Default::default()
            })?;

            let mut expired = 0usize;
            for request in stale.iter().filter(|request| request.round == round) {
                if self.withdraw(request.id)? {
                    expired += 1;
                }
            }
            if expired > 0 {
                info!(ride_id = %ride_id, round, expired, "offers timed out");
            }

            self.widen_if_exhausted(ride_id)
        })?;

        self.follow_up(follow_up).await
    }

    pub fn cancel_ride(&self, ride_id: RideId) -> Result<Ride, AppError> {
        let cancellation = self.locked(ride_id, || {
            let cancellation = self.rides.cancel_ride(ride_id)?;
            let withdrawn = self.cancel_pending_requests(ride_id)?;
            if let Some(driver_id) = cancellation.released_driver {
                self.active_rides.remove_if(&driver_id, |_, active| *active == ride_id);
            }
            info!(ride_id = %ride_id, withdrawn, "outstanding offers withdrawn");
            Ok(cancellation)
        })?;

        if let Some(driver_id) = cancellation.released_driver {
            self.release_driver(driver_id);
        }
        self.publish(DispatchEvent::RideCancelled {
            ride_id,
            at: Utc::now(),
        });
        Ok(cancellation.ride)
    }

    pub fn complete_ride(&self, ride_id: RideId, review: Option<String>) -> Result<Ride, AppError> {
        let ride = self.locked(ride_id, || {
            let ride = self.rides.complete_ride(ride_id, review)?;
            if let Some(driver_id) = ride.driver_id {
                self.active_rides.remove_if(&driver_id, |_, active| *active == ride_id);
            }
            Ok(ride)
        })?;

        if let Some(driver_id) = ride.driver_id {
            self.release_driver(driver_id);
        }
        self.publish(DispatchEvent::RideCompleted {
            ride_id,
            driver_id: ride.driver_id,
            at: Utc::now(),
        });
        Ok(ride)
    }

    pub fn reject_ride(&self, ride_id: RideId) -> Result<Ride, AppError> {
        let ride = self.locked(ride_id, || {
            let ride = self.rides.reject_ride(ride_id)?;
            self.cancel_pending_requests(ride_id)?;
            Ok(ride)
        })?;

        self.publish(DispatchEvent::RideRejected {
            ride_id,
            at: Utc::now(),
        });
        Ok(ride)
    }

    fn accept(
        &self,
        request_id: RideRequestId,
        ride_id: RideId,
        driver_id: DriverId,
    ) -> Result<(RespondOutcome, FollowUp), AppError> {
        let request = self.request(request_id)?;
        match request.status {
            RideRequestStatus::Success => return self.reaccept(request_id, ride_id, driver_id),
            RideRequestStatus::Cancelled => {
                let outcome = self.late_acceptance(ride_id, driver_id)?;
                return Ok((outcome, FollowUp::Nothing));
            }
            RideRequestStatus::Pending => {}
        }

        let ride = match self.active_rides.entry(driver_id) {
            // An earlier attempt assigned the ride but could not finish the commit.
            Entry::Occupied(occupied) if *occupied.get() == ride_id => {
                drop(occupied);
                let ride = self.rides.ride(ride_id)?;
                if ride.status != RideStatus::Running || ride.driver_id != Some(driver_id) {
                    self.active_rides.remove_if(&driver_id, |_, active| *active == ride_id);
                    return Err(AppError::ride_transition(ride.status, RideStatus::Running));
                }
                info!(ride_id = %ride_id, driver_id = %driver_id, "resuming interrupted assignment");
                ride
            }
            Entry::Occupied(occupied) => {
                warn!(
                    driver_id = %driver_id,
                    ride_id = %ride_id,
                    busy_with = %occupied.get(),
                    "driver accepted an offer while on another ride"
                );
                return Err(AppError::DriverBusy(driver_id));
            }
            Entry::Vacant(vacant) => match self.rides.assign(ride_id, driver_id) {
                Ok(ride) => {
                    vacant.insert(ride_id);
                    ride
                }
                Err(AppError::InvalidTransition { .. }) => {
                    drop(vacant);
                    self.withdraw(request_id)?;
                    let outcome = self.late_acceptance(ride_id, driver_id)?;
                    return Ok((outcome, FollowUp::Nothing));
                }
                Err(err) => return Err(err),
            },
        };

        if let Err(err) = self.mark_winner(request_id) {
            self.undo_assignment(ride_id, driver_id);
            return Err(err);
        }

        let withdrawn = self.cancel_pending_requests(ride_id)?;
        info!(
            ride_id = %ride_id,
            driver_id = %driver_id,
            withdrawn,
            "offer accepted"
        );
        Ok((
            RespondOutcome::Success,
            FollowUp::Assigned {
                ride,
                driver_id,
                request_id,
            },
        ))
    }

    fn mark_winner(&self, request_id: RideRequestId) -> Result<(), AppError> {
        match self.store.update_request_if(
            request_id,
            RideRequestStatus::Pending,
            RideRequestStatus::Success,
        )? {
            Conditional::Applied(_) => Ok(()),
            Conditional::Mismatch(request) => Err(AppError::InvalidTransition {
                from: request.status.to_string(),
                to: RideRequestStatus::Success.to_string(),
            }),
            Conditional::Missing => Err(AppError::RideRequestNotFound(request_id)),
        }
    }

    // Puts the ride back to pending. If that write fails too, the driver keeps
    // the engagement so a retry of the same accept resumes the commit.
    fn undo_assignment(&self, ride_id: RideId, driver_id: DriverId) {
        match self.rides.revert_assignment(ride_id, driver_id) {
            Ok(_) => {
                self.active_rides.remove_if(&driver_id, |_, active| *active == ride_id);
                warn!(ride_id = %ride_id, driver_id = %driver_id, "assignment rolled back");
            }
            Err(err) => {
                warn!(
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    error = %err,
                    "assignment rollback failed, left resumable"
                );
            }
        }
    }

    // Accept repeated on a winning offer. Finishes a commit whose sibling
    // cancellation or availability update did not run.
    fn reaccept(
        &self,
        request_id: RideRequestId,
        ride_id: RideId,
        driver_id: DriverId,
    ) -> Result<(RespondOutcome, FollowUp), AppError> {
        let ride = self.rides.ride(ride_id)?;
        if ride.status != RideStatus::Running || ride.driver_id != Some(driver_id) {
            return Ok((RespondOutcome::Success, FollowUp::Nothing));
        }

        let withdrawn = self.cancel_pending_requests(ride_id)?;
        let still_available = self
            .registry
            .location(driver_id)
            .is_ok_and(|record| record.available);
        let follow_up = if withdrawn > 0 || still_available {
            FollowUp::Assigned {
                ride,
                driver_id,
                request_id,
            }
        } else {
            FollowUp::Nothing
        };
        Ok((RespondOutcome::Success, follow_up))
    }

    fn late_acceptance(&self, ride_id: RideId, driver_id: DriverId) -> Result<RespondOutcome, AppError> {
        let ride = self.rides.ride(ride_id)?;
        match ride.driver_id {
            Some(winner) => {
                debug!(
                    ride_id = %ride_id,
                    driver_id = %driver_id,
                    winner = %winner,
                    "ride already assigned"
                );
                Ok(RespondOutcome::AlreadyAssigned)
            }
            None => Err(AppError::ride_transition(ride.status, RideStatus::Running)),
        }
    }

    fn decline(
        &self,
        request_id: RideRequestId,
        ride_id: RideId,
    ) -> Result<(RespondOutcome, FollowUp), AppError> {
        match self.store.update_request_if(
            request_id,
            RideRequestStatus::Pending,
            RideRequestStatus::Cancelled,
        )? {
            Conditional::Applied(_) => {
                info!(ride_id = %ride_id, request_id = %request_id, "offer declined");
            }
            Conditional::Mismatch(request) if request.status == RideRequestStatus::Cancelled => {
                return Ok((RespondOutcome::Cancelled, FollowUp::Nothing));
            }
            Conditional::Mismatch(request) => {
                return Err(AppError::InvalidTransition {
                    from: request.status.to_string(),
                    to: RideRequestStatus::Cancelled.to_string(),
                });
            }
            Conditional::Missing => return Err(AppError::RideRequestNotFound(request_id)),
        }

        let follow_up = self.widen_if_exhausted(ride_id)?;
        Ok((RespondOutcome::Cancelled, follow_up))
    }

    // Drivers offered in earlier rounds are never asked again.
    fn widen_if_exhausted(&self, ride_id: RideId) -> Result<FollowUp, AppError> {
        let ride = self.rides.ride(ride_id)?;
        if ride.status != RideStatus::Pending {
            return Ok(FollowUp::Nothing);
        }

        let offers = self.store.requests(&RideRequestFilter {
            ride_id: Some(ride_id),
            ..Default::default()
        })?;
        if offers
            .iter()
            .any(|offer| offer.status == RideRequestStatus::Pending)
        {
            return Ok(FollowUp::Nothing);
        }

        let next_round = offers
            .iter()
            .map(|offer| offer.round + 1)
            .max()
            .unwrap_or(0);
        if next_round >= self.config.max_fanout_rounds {
            info!(ride_id = %ride_id, rounds = next_round, "fanout rounds exhausted");
            return self.reject_unserved(ride_id);
        }

        let exclude: HashSet<DriverId> = offers.iter().map(|offer| offer.driver_id).collect();
        match self.open_round(&ride, next_round, &exclude) {
            Ok((offer, _)) => Ok(FollowUp::Schedule(offer)),
            Err(AppError::NoDriversAvailable) => self.reject_unserved(ride_id),
            Err(err) => Err(err),
        }
    }

    fn open_round(
        &self,
        ride: &Ride,
        round: u32,
        exclude: &HashSet<DriverId>,
    ) -> Result<(OfferRound, Vec<NearbyDriver>), AppError> {
        let candidates =
            self.registry
                .available_drivers_near(&ride.pickup, self.config.fanout_size, exclude);
        if candidates.is_empty() {
            return Err(AppError::NoDriversAvailable);
        }

        let now = Utc::now();
        for candidate in &candidates {
            self.store.insert_request(RideRequest {
                id: Uuid::new_v4(),
                ride_id: ride.id,
                driver_id: candidate.driver_id,
                status: RideRequestStatus::Pending,
                round,
                created_at: now,
                updated_at: now,
            })?;
        }

        self.metrics
            .ride_offers_total
            .inc_by(candidates.len() as u64);
        info!(
            ride_id = %ride.id,
            round,
            offered = candidates.len(),
            "ride offered to drivers"
        );
        self.publish(DispatchEvent::RideOffered {
            ride_id: ride.id,
            round,
            drivers: candidates.iter().map(|c| c.driver_id).collect(),
            at: now,
        });

        let offer = OfferRound {
            ride_id: ride.id,
            round,
            deadline: Instant::now() + self.config.offer_timeout,
        };
        Ok((offer, candidates))
    }

    fn reject_unserved(&self, ride_id: RideId) -> Result<FollowUp, AppError> {
        match self.rides.reject_ride(ride_id) {
            Ok(_) => {}
            Err(AppError::InvalidTransition { .. }) => return Ok(FollowUp::Nothing),
            Err(err) => return Err(err),
        }
        self.cancel_pending_requests(ride_id)?;

        self.metrics.rides_rejected_total.inc();
        warn!(ride_id = %ride_id, "no drivers available; ride rejected");
        self.publish(DispatchEvent::RideRejected {
            ride_id,
            at: Utc::now(),
        });
        Ok(FollowUp::Nothing)
    }

    fn cancel_pending_requests(&self, ride_id: RideId) -> Result<usize, AppError> {
        let pending = self.store.requests(&RideRequestFilter {
            ride_id: Some(ride_id),
            status: Some(RideRequestStatus::Pending),
            ..Default::default()
        })?;

        let mut withdrawn = 0;
        for request in pending {
            if self.withdraw(request.id)? {
                withdrawn += 1;
            }
        }
        Ok(withdrawn)
    }

    fn withdraw(&self, request_id: RideRequestId) -> Result<bool, AppError> {
        let outcome = self.store.update_request_if(
            request_id,
            RideRequestStatus::Pending,
            RideRequestStatus::Cancelled,
        )?;
        Ok(matches!(outcome, Conditional::Applied(_)))
    }

    async fn follow_up(&self, follow_up: FollowUp) -> Result<(), AppError> {
        match follow_up {
            FollowUp::Nothing => {}
            FollowUp::Schedule(offer) => {
                enqueue_round(&self.offer_tx, &self.metrics, offer).await?;
            }
            FollowUp::Assigned {
                ride,
                driver_id,
                request_id,
            } => {
                if let Err(err) = self.registry.set_availability(driver_id, false) {
                    warn!(driver_id = %driver_id, error = %err, "failed to mark driver unavailable");
                }
                let waited = (Utc::now() - ride.created_at)
                    .to_std()
                    .unwrap_or_default()
                    .as_secs_f64();
                self.metrics.assignment_latency_seconds.observe(waited);
                self.publish(DispatchEvent::RideAssigned {
                    ride_id: ride.id,
                    driver_id,
                    request_id,
                    at: Utc::now(),
                });
            }
        }
        Ok(())
    }

    fn release_driver(&self, driver_id: DriverId) {
        if let Err(err) = self.registry.set_availability(driver_id, true) {
            warn!(driver_id = %driver_id, error = %err, "failed to release driver");
        }
    }

    fn publish(&self, event: DispatchEvent) {
        let _ = self.events_tx.send(event);
    }

    // Runs `f` under the ride's lock. The lock entry is dropped again as soon
    // as the ride is no longer pending; later callers get a fresh lock and
    // rely on the store's conditional updates.
    fn locked<T>(
        &self,
        ride_id: RideId,
        f: impl FnOnce() -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let result = {
            let lock = self.ride_locks.entry(ride_id).or_default().clone();
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let pending = matches!(
            self.store.ride(ride_id),
            Ok(Some(ride)) if ride.status == RideStatus::Pending
        );
        if !pending {
            self.ride_locks.remove(&ride_id);
        }
        result
    }
}
