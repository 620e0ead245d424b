use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use crate::config::Config;
use crate::engine::dispatch::DispatchCoordinator;
use crate::engine::queue::OfferRound;
use crate::engine::registry::DriverRegistry;
use crate::engine::rides::RideStateMachine;
use crate::models::event::DispatchEvent;
use crate::observability::metrics::Metrics;
use crate::store::{InMemoryRideStore, RideStore};

pub struct AppState {
    pub registry: Arc<DriverRegistry>,
    pub rides: Arc<RideStateMachine>,
    pub store: Arc<dyn RideStore>,
    pub dispatcher: Arc<DispatchCoordinator>,
    pub events_tx: broadcast::Sender<DispatchEvent>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<OfferRound>) {
        Self::with_store(config, Arc::new(InMemoryRideStore::new()))
    }

    pub fn with_store(
        config: &Config,
        store: Arc<dyn RideStore>,
    ) -> (Self, mpsc::Receiver<OfferRound>) {
        let (offer_tx, offer_rx) = mpsc::channel(config.offer_queue_size);
        let (events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);
        let metrics = Metrics::new();

        let registry = Arc::new(DriverRegistry::new(
            config.geo_cell_degrees,
            metrics.clone(),
        ));
        let rides = Arc::new(RideStateMachine::new(store.clone()));
        let dispatcher = Arc::new(DispatchCoordinator::new(
            registry.clone(),
            rides.clone(),
            store.clone(),
            config.dispatch.clone(),
            offer_tx,
            events_tx.clone(),
            metrics.clone(),
        ));

        (
            Self {
                registry,
                rides,
                store,
                dispatcher,
                events_tx,
                metrics,
            },
            offer_rx,
        )
    }
}
