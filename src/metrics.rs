use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};

/// Consensus metrics. The registry is exposed so an embedding binary can
/// mount it on whatever exporter it runs.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Mutex<Registry>>,

    pub height: Gauge<i64, AtomicI64>,
    pub round: Gauge<i64, AtomicI64>,
    pub step: Gauge<i64, AtomicI64>,
    pub proposals_received: Counter,
    pub votes_received: Counter,
    pub conflicting_votes: Counter,
    pub sign_aggrs_received: Counter,
    pub sign_aggrs_sent: Counter,
    pub timeouts_fired: Counter,
    pub height_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let height = Gauge::<i64, AtomicI64>::default();
        registry.register("blsbft_height", "Current consensus height", height.clone());

        let round = Gauge::<i64, AtomicI64>::default();
        registry.register("blsbft_round", "Current consensus round", round.clone());

        let step = Gauge::<i64, AtomicI64>::default();
        registry.register("blsbft_step", "Current round step ordinal", step.clone());

        let proposals_received = Counter::default();
        registry.register(
            "blsbft_proposals_received_total",
            "Proposals accepted",
            proposals_received.clone(),
        );

        let votes_received = Counter::default();
        registry.register(
            "blsbft_votes_received_total",
            "Votes tallied",
            votes_received.clone(),
        );

        let conflicting_votes = Counter::default();
        registry.register(
            "blsbft_conflicting_votes_total",
            "Conflicting vote pairs recorded as evidence",
            conflicting_votes.clone(),
        );

        let sign_aggrs_received = Counter::default();
        registry.register(
            "blsbft_sign_aggrs_received_total",
            "Maj23 signature aggregates accepted",
            sign_aggrs_received.clone(),
        );

        let sign_aggrs_sent = Counter::default();
        registry.register(
            "blsbft_sign_aggrs_sent_total",
            "Maj23 signature aggregates built and broadcast",
            sign_aggrs_sent.clone(),
        );

        let timeouts_fired = Counter::default();
        registry.register(
            "blsbft_timeouts_fired_total",
            "Timeout ticks that caused a transition",
            timeouts_fired.clone(),
        );

        let height_duration = Histogram::new(exponential_buckets(0.1, 2.0, 12));
        registry.register(
            "blsbft_height_duration_seconds",
            "Time from entering a height to finalizing it",
            height_duration.clone(),
        );

        Self {
            registry: Arc::new(Mutex::new(registry)),
            height,
            round,
            step,
            proposals_received,
            votes_received,
            conflicting_votes,
            sign_aggrs_received,
            sign_aggrs_sent,
            timeouts_fired,
            height_duration,
        }
    }

    /// Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        let registry = self.registry.lock().expect("metrics registry poisoned");
        prometheus_client::encoding::text::encode(&mut buf, &registry)
            .expect("metrics encoding cannot fail");
        buf
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
