use crate::predictor;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::atomic::AtomicU64;

/// Outcome of a predictor query.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Unavailable,
    Malformed,
    Timeout,
}

impl From<&predictor::Error> for Outcome {
    fn from(err: &predictor::Error) -> Self {
        match err {
            predictor::Error::Timeout(_) => Outcome::Timeout,
            predictor::Error::Malformed(_) => Outcome::Malformed,
            predictor::Error::Spawn(_)
            | predictor::Error::Wait(_)
            | predictor::Error::Exited(_)
            | predictor::Error::MissingResult(_) => Outcome::Unavailable,
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Prediction {
    pub outcome: Outcome,
}

/// Metrics for the [`Generator`](super::Generator).
#[derive(Default)]
pub struct Metrics {
    /// Number of packets sent
    pub sent: Counter,
    /// Number of replies correlated with a sent packet
    pub received: Counter,
    /// Number of replies dropped because they matched no pending packet
    pub unknown: Counter,
    /// Number of pending packets evicted after exceeding their ttl
    pub evicted: Counter,
    /// Number of predictor queries by outcome
    pub predictions: Family<Prediction, Counter>,
    /// Number of packets awaiting a reply
    pub pending: Gauge,
    /// Last predicted bandwidth ratio
    pub ratio: Gauge<f64, AtomicU64>,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Metrics::default();
        registry.register("sent", "Number of packets sent", metrics.sent.clone());
        registry.register(
            "received",
            "Number of replies correlated with a sent packet",
            metrics.received.clone(),
        );
        registry.register(
            "unknown",
            "Number of replies dropped because they matched no pending packet",
            metrics.unknown.clone(),
        );
        registry.register(
            "evicted",
            "Number of pending packets evicted after exceeding their ttl",
            metrics.evicted.clone(),
        );
        registry.register(
            "predictions",
            "Number of predictor queries by outcome",
            metrics.predictions.clone(),
        );
        registry.register(
            "pending",
            "Number of packets awaiting a reply",
            metrics.pending.clone(),
        );
        registry.register(
            "ratio",
            "Last predicted bandwidth ratio",
            metrics.ratio.clone(),
        );
        metrics
    }

    /// Record the outcome of a predictor query.
    pub fn prediction(&self, outcome: Outcome) {
        self.predictions.get_or_create(&Prediction { outcome }).inc();
    }
}
