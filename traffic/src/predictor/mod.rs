//! Estimate the available bandwidth ratio from recent latency statistics.
//!
//! A [Predictor] is consulted at most once per received packet and only once the
//! rolling windows are full. Failures are never retried: the generator keeps its last
//! known ratio and continues pacing.

use std::{io, process::ExitStatus, time::Duration};
use thiserror::Error;

pub mod process;

/// Errors that can occur when querying a [Predictor].
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn predictor: {0}")]
    Spawn(io::Error),
    #[error("failed to wait for predictor: {0}")]
    Wait(io::Error),
    #[error("predictor exited with {0}")]
    Exited(ExitStatus),
    #[error("predictor timed out after {0:?}")]
    Timeout(Duration),
    #[error("predictor result unavailable: {0}")]
    MissingResult(io::Error),
    #[error("predictor result malformed: {0:?}")]
    Malformed(String),
}

impl Error {
    /// Whether the predictor answered with content that could not be parsed.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed(_))
    }
}

/// One slot of the history handed to a [Predictor].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    /// Rolling mean latency (seconds).
    pub mean: f64,
    /// Rolling standard deviation of latency (seconds).
    pub stdev: f64,
    /// Raw round-trip latency (seconds).
    pub latency: f64,
}

/// Interface that any bandwidth predictor must implement.
pub trait Predictor {
    /// Predict the available bandwidth ratio given `history` (oldest first).
    ///
    /// The returned value is not required to lie in `[0, 1]`: it is clamped when used.
    fn predict(&mut self, history: &[Sample]) -> Result<f64, Error>;
}

/// A [Predictor] that always returns the same ratio.
#[derive(Clone, Copy, Debug)]
pub struct Constant(pub f64);

impl Predictor for Constant {
    fn predict(&mut self, _history: &[Sample]) -> Result<f64, Error> {
        Ok(self.0)
    }
}

/// Parse the textual answer of a predictor.
///
/// Only the first line is considered. Non-finite values are rejected.
pub fn parse(content: &str) -> Result<f64, Error> {
    let line = content.lines().next().unwrap_or_default().trim();
    match line.parse::<f64>() {
        Ok(ratio) if ratio.is_finite() => Ok(ratio),
        _ => Err(Error::Malformed(line.to_string())),
    }
}
