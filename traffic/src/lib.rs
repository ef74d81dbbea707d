//! Generate probe traffic and pace it from observed round-trip latency.
//!
//! A [generator::Generator] emits UDP-like probe packets towards a single peer and
//! correlates each echoed reply with its transmission to measure round-trip delay.
//! It runs in one of two modes:
//!
//! - **Noise**: packets are paced by an exponential interval, independent of feedback.
//! - **Adaptive**: recent latency statistics are handed to a [predictor::Predictor] that
//!   estimates the fraction of available bandwidth, and the next send delay is derived
//!   from that ratio (see [pacing]).
//!
//! The crate does not implement networking. The hosting environment supplies time
//! ([Clock]), timers ([Scheduler]) and packet transmission ([Transport]) and delivers
//! send/receive events to the generator one at a time. The [simulated] module provides
//! a deterministic host for tests and experiments.
//!
//! # Status
//!
//! `probe-traffic` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use bytes::Bytes;
use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, SystemTime},
};

pub mod generator;
pub mod mocks;
pub mod pacing;
pub mod pending;
pub mod predictor;
pub mod simulated;
pub mod window;

pub use generator::{Config, Error, Generator, Observer, Received, Sent};
pub use pacing::Mode;
pub use predictor::{Predictor, Sample};
pub use window::Window;

/// Opaque identifier assigned to a packet by the [Transport].
///
/// The generator only uses it as a correlation key and never interprets it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Interface that any host must implement to provide the current time.
pub trait Clock {
    /// Returns the current (simulation) time.
    ///
    /// Time must never go backwards.
    fn current(&self) -> SystemTime;
}

/// Interface that any host must implement to schedule timers.
///
/// When a timer fires, the host invokes [generator::Generator::send] (or the equivalent
/// entry point of whatever registered it).
pub trait Scheduler: Clock {
    /// Handle used to cancel a scheduled timer.
    type Handle;

    /// Schedule a timer to fire after `delay`.
    fn schedule(&mut self, delay: Duration) -> Self::Handle;

    /// Cancel a previously scheduled timer.
    ///
    /// Returns `true` if the timer was still pending.
    fn cancel(&mut self, handle: Self::Handle) -> bool;
}

/// Interface that any host must implement to transmit packets.
pub trait Transport {
    /// Send `payload` to `peer` with the given type-of-service byte, returning the
    /// identifier assigned to the packet.
    ///
    /// Identifiers must not be reused while a packet carrying them is still in flight.
    fn transmit(&mut self, peer: SocketAddr, tos: u8, payload: Bytes) -> PacketId;
}
