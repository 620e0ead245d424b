use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::sleep_until;
use tracing::{error, info, warn};

use crate::engine::dispatch::DispatchCoordinator;
use crate::engine::queue::OfferRound;

pub async fn run_offer_expiry(
    dispatcher: Arc<DispatchCoordinator>,
    mut offer_rx: mpsc::Receiver<OfferRound>,
) {
    info!("offer expiry engine started");

    while let Some(offer) = offer_rx.recv().await {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            sleep_until(offer.deadline).await;
            dispatcher.metrics().offer_rounds_pending.dec();

            if let Err(err) = dispatcher.expire_round(offer.ride_id, offer.round).await {
                error!(
                    ride_id = %offer.ride_id,
                    round = offer.round,
                    error = %err,
                    "failed to expire offer round"
                );
            }
        });
    }

    warn!("offer expiry engine stopped: queue channel closed");
}
