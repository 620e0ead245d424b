use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub rides_requested_total: IntCounter,
    pub ride_offers_total: IntCounter,
    pub dispatch_responses_total: IntCounterVec,
    pub rides_rejected_total: IntCounter,
    pub offer_rounds_pending: IntGauge,
    pub assignment_latency_seconds: Histogram,
    pub drivers_available: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let rides_requested_total =
            IntCounter::new("rides_requested_total", "Total rides requested by riders")
                .expect("valid rides_requested_total metric");

        let ride_offers_total =
            IntCounter::new("ride_offers_total", "Total ride requests offered to drivers")
                .expect("valid ride_offers_total metric");

        let dispatch_responses_total = IntCounterVec::new(
            Opts::new("dispatch_responses_total", "Driver responses by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_responses_total metric");

        let rides_rejected_total =
            IntCounter::new("rides_rejected_total", "Rides rejected for lack of drivers")
                .expect("valid rides_rejected_total metric");

        let offer_rounds_pending = IntGauge::new(
            "offer_rounds_pending",
            "Offer rounds waiting for their response deadline",
        )
        .expect("valid offer_rounds_pending metric");

        let assignment_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "assignment_latency_seconds",
            "Time from ride creation to driver assignment in seconds",
        ))
        .expect("valid assignment_latency_seconds metric");

        let drivers_available =
            IntGauge::new("drivers_available", "Drivers currently available for dispatch")
                .expect("valid drivers_available metric");

        registry
            .register(Box::new(rides_requested_total.clone()))
            .expect("register rides_requested_total");
        registry
            .register(Box::new(ride_offers_total.clone()))
            .expect("register ride_offers_total");
        registry
            .register(Box::new(dispatch_responses_total.clone()))
            .expect("register dispatch_responses_total");
        registry
            .register(Box::new(rides_rejected_total.clone()))
            .expect("register rides_rejected_total");
        registry
            .register(Box::new(offer_rounds_pending.clone()))
            .expect("register offer_rounds_pending");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");
        registry
            .register(Box::new(drivers_available.clone()))
            .expect("register drivers_available");

        Self {
            registry,
            rides_requested_total,
            ride_offers_total,
            dispatch_responses_total,
            rides_rejected_total,
            offer_rounds_pending,
            assignment_latency_seconds,
            drivers_available,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
