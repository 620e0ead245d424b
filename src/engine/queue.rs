use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::AppError;
use crate::models::RideId;
use crate::observability::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct OfferRound {
    pub ride_id: RideId,
    pub round: u32,
    pub deadline: Instant,
}

pub async fn enqueue_round(
    offer_tx: &mpsc::Sender<OfferRound>,
    metrics: &Metrics,
    round: OfferRound,
) -> Result<(), AppError> {
    offer_tx
        .send(round)
        .await
        .map_err(|err| AppError::Internal(format!("offer queue send failed: {err}")))?;

    metrics.offer_rounds_pending.inc();
    Ok(())
}
