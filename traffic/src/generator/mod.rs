//! Emit probe packets and pace them from observed round-trip latency.
//!
//! # Lifecycle
//!
//! A [Generator] starts Stopped. [Generator::start] validates the [Config] and schedules
//! the first transmission immediately. Each time that timer fires, the host calls
//! [Generator::send], which transmits one packet, records its send time and schedules
//! the next transmission (unless the packet budget is exhausted). Each time a reply
//! arrives, the host calls [Generator::receive], which computes the round-trip delay,
//! updates the rolling windows and (in [Mode::Adaptive], once the windows are full)
//! queries the [Predictor] for a new bandwidth ratio.
//!
//! [Generator::stop] cancels the outstanding timer and discards all per-run state.
//! Stopping is idempotent and events delivered after stop are ignored.
//!
//! # Failures
//!
//! Replies that match no pending packet are dropped. Predictor failures keep the last
//! known ratio. Neither is surfaced to the host (beyond logs and [metrics]). An invalid
//! configuration prevents the generator from starting and a duplicate packet identifier
//! (a broken [Transport]) halts it.

use crate::{
    pacing::{self, Mode, Pacer},
    pending,
    predictor::{Predictor, Sample},
    PacketId, Scheduler, Transport, Window,
};
use bytes::Bytes;
use prometheus_client::registry::Registry;
use rand::Rng;
use rand_distr::{Distribution, Normal};
use std::{
    net::SocketAddr,
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

pub mod metrics;

/// Errors that can occur when interacting with a [Generator].
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid view size: {0}")]
    InvalidViewSize(usize),
    #[error("invalid packet size distribution (mean {0}, variance {1})")]
    InvalidPacketSize(f64, f64),
    #[error("invalid interval mean: {0}")]
    InvalidIntervalMean(f64),
    #[error("invalid initial ratio: {0}")]
    InvalidRatio(f64),
    #[error("invalid base interval: {0:?}")]
    InvalidInterval(Duration),
    #[error("invalid exponent: {0}")]
    InvalidExponent(u32),
    #[error("invalid peer: {0}")]
    InvalidPeer(SocketAddr),
    #[error("already running")]
    AlreadyRunning,
    #[error("duplicate packet identifier: {0}")]
    DuplicatePacket(PacketId),
}

/// Configuration for a [Generator].
#[derive(Clone, Debug)]
pub struct Config {
    /// Destination of probe packets.
    pub peer: SocketAddr,

    /// Type-of-service byte (only meaningful for IPv4 peers).
    pub tos: u8,

    /// Maximum number of packets to send (0 means unbounded).
    pub max_packets: u64,

    /// Mean of the (normal) packet size distribution, in bytes.
    pub packet_size_mean: f64,

    /// Variance of the (normal) packet size distribution.
    pub packet_size_variance: f64,

    /// Mean of the (exponential) interval distribution, in seconds.
    ///
    /// A mean of exactly 0 selects [Mode::Adaptive]. Must not exceed
    /// [pacing::MAX_DELAY].
    pub interval_mean: f64,

    /// Base interval scaling the adaptive delay (the delay when the ratio is 0).
    ///
    /// Must be non-zero in [Mode::Adaptive] and must not exceed [pacing::MAX_DELAY].
    pub interval: Duration,

    /// Exponent of the adaptive ratio-to-delay transform (at most [i32::MAX]).
    pub exponent: u32,

    /// Number of samples retained by each rolling window.
    pub view_size: usize,

    /// Bandwidth ratio used until the predictor first answers.
    pub initial_ratio: f64,

    /// Maximum time a packet may await its reply before being forgotten.
    ///
    /// `None` retains unanswered packets for the lifetime of the run.
    pub pending_ttl: Option<Duration>,
}

impl Config {
    /// Create a configuration targeting `peer` with default settings.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            tos: 0,
            max_packets: 0,
            packet_size_mean: 1000.0,
            packet_size_variance: 200.0,
            interval_mean: 1.0,
            interval: Duration::from_secs(1),
            exponent: pacing::DEFAULT_EXPONENT,
            view_size: 20,
            initial_ratio: 0.0,
            pending_ttl: None,
        }
    }

    /// Ensure the configuration can be used to start a [Generator].
    pub fn validate(&self) -> Result<(), Error> {
        if self.peer.port() == 0 || self.peer.ip().is_unspecified() {
            return Err(Error::InvalidPeer(self.peer));
        }
        if self.view_size == 0 {
            return Err(Error::InvalidViewSize(self.view_size));
        }
        if !self.packet_size_mean.is_finite()
            || !self.packet_size_variance.is_finite()
            || self.packet_size_variance < 0.0
        {
            return Err(Error::InvalidPacketSize(
                self.packet_size_mean,
                self.packet_size_variance,
            ));
        }
        if !self.interval_mean.is_finite()
            || self.interval_mean < 0.0
            || self.interval_mean > pacing::MAX_DELAY.as_secs_f64()
        {
            return Err(Error::InvalidIntervalMean(self.interval_mean));
        }
        if self.interval > pacing::MAX_DELAY
            || (self.interval_mean == 0.0 && self.interval.is_zero())
        {
            return Err(Error::InvalidInterval(self.interval));
        }
        if i32::try_from(self.exponent).is_err() {
            return Err(Error::InvalidExponent(self.exponent));
        }
        if !self.initial_ratio.is_finite() {
            return Err(Error::InvalidRatio(self.initial_ratio));
        }
        Ok(())
    }
}

/// A packet handed to the [Transport].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sent {
    pub packet: PacketId,
    pub peer: SocketAddr,
    pub size: usize,
    pub at: SystemTime,
}

/// A reply correlated with a previously [Sent] packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Received {
    pub packet: PacketId,
    pub from: SocketAddr,
    pub size: usize,
    pub delay: Duration,
    pub at: SystemTime,
}

/// Listener notified of the traffic emitted and received by a [Generator].
pub trait Observer {
    fn on_send(&mut self, _sent: &Sent) {}

    fn on_receive(&mut self, _received: &Received) {}
}

/// State of a running generator, discarded on stop.
struct Run<H> {
    pacer: Pacer,
    pending: pending::Table,
    latencies: Window,
    means: Window,
    stdevs: Window,
    sizes: Normal<f64>,
    ratio: f64,
    sent: u64,
    timer: Option<H>,
}

/// Probe traffic generator.
pub struct Generator<E: Scheduler + Transport + Rng, P: Predictor> {
    context: E,
    cfg: Config,
    predictor: P,
    observers: Vec<Box<dyn Observer>>,
    metrics: metrics::Metrics,

    run: Option<Run<E::Handle>>,
}

impl<E: Scheduler + Transport + Rng, P: Predictor> Generator<E, P> {
    /// Create a new (stopped) generator.
    pub fn new(context: E, cfg: Config, predictor: P, registry: &mut Registry) -> Self {
        Self {
            context,
            cfg,
            predictor,
            observers: Vec::new(),
            metrics: metrics::Metrics::init(registry),
            run: None,
        }
    }

    /// Register an [Observer] notified of every send and correlated receive.
    pub fn register(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Start generating traffic.
    ///
    /// The first packet is scheduled for immediate transmission.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.run.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.cfg.validate()?;
        let sizes = Normal::new(
            self.cfg.packet_size_mean,
            self.cfg.packet_size_variance.sqrt(),
        )
        .map_err(|_| {
            Error::InvalidPacketSize(self.cfg.packet_size_mean, self.cfg.packet_size_variance)
        })?;
        let pacer = Pacer::new(self.cfg.interval_mean, self.cfg.interval, self.cfg.exponent)
            .map_err(|_| Error::InvalidIntervalMean(self.cfg.interval_mean))?;
        let mode = pacer.mode();
        if self.cfg.tos != 0 && self.cfg.peer.is_ipv6() {
            warn!(tos = self.cfg.tos, peer = ?self.cfg.peer, "type of service ignored for ipv6 peer");
        }

        let timer = self.context.schedule(Duration::ZERO);
        let ratio = self.cfg.initial_ratio;
        self.metrics.ratio.set(ratio);
        self.metrics.pending.set(0);
        self.run = Some(Run {
            pacer,
            pending: pending::Table::new(self.cfg.pending_ttl),
            latencies: Window::new(self.cfg.view_size),
            means: Window::new(self.cfg.view_size),
            stdevs: Window::new(self.cfg.view_size),
            sizes,
            ratio,
            sent: 0,
            timer: Some(timer),
        });
        info!(peer = ?self.cfg.peer, ?mode, view_size = self.cfg.view_size, "started generator");
        Ok(())
    }

    /// Transmit the next packet (called when the send timer fires).
    ///
    /// Returns an error only when the [Transport] reused an identifier that is still
    /// pending, in which case the generator has halted.
    pub fn send(&mut self) -> Result<(), Error> {
        let Some(run) = self.run.as_mut() else {
            trace!("ignoring send while stopped");
            return Ok(());
        };
        run.timer = None;

        // Generate packet
        let draw = run.sizes.sample(&mut self.context);
        let size = (draw as i64).unsigned_abs() as usize;
        let payload = Bytes::from(vec![0u8; size]);
        let packet = self.context.transmit(self.cfg.peer, self.cfg.tos, payload);
        let now = self.context.current();

        // Track packet
        let evicted = run.pending.expire(now);
        if evicted > 0 {
            debug!(evicted, "evicted unanswered packets");
            self.metrics.evicted.inc_by(evicted as u64);
        }
        if let Err(err) = run.pending.record(packet, now) {
            error!(?err, "transport reused a pending packet identifier");
            self.run = None;
            return Err(Error::DuplicatePacket(packet));
        }
        run.sent += 1;
        self.metrics.sent.inc();
        self.metrics.pending.set(run.pending.len() as i64);
        debug!(?packet, size, sent = run.sent, "sent packet");
        let sent = Sent {
            packet,
            peer: self.cfg.peer,
            size,
            at: now,
        };
        for observer in self.observers.iter_mut() {
            observer.on_send(&sent);
        }

        // Schedule next packet
        if self.cfg.max_packets != 0 && run.sent >= self.cfg.max_packets {
            info!(sent = run.sent, "packet budget exhausted");
            return Ok(());
        }
        let delay = run.pacer.next_delay(&mut self.context, run.ratio);
        trace!(?delay, ratio = run.ratio, "scheduling next packet");
        run.timer = Some(self.context.schedule(delay));
        Ok(())
    }

    /// Handle a reply (called once per arriving packet).
    pub fn receive(&mut self, packet: PacketId, from: SocketAddr, size: usize) {
        let Some(run) = self.run.as_mut() else {
            trace!(?packet, "ignoring receive while stopped");
            return;
        };
        let now = self.context.current();
        let sent_at = match run.pending.resolve(packet) {
            Ok(sent_at) => sent_at,
            Err(err) => {
                debug!(?err, ?from, "dropping reply");
                self.metrics.unknown.inc();
                return;
            }
        };
        let delay = now.duration_since(sent_at).unwrap_or_default();
        self.metrics.received.inc();
        self.metrics.pending.set(run.pending.len() as i64);

        // Update rolling statistics
        run.latencies.push(delay.as_secs_f64());
        let mean = run.latencies.mean();
        run.means.push(mean);
        let stdev = run.latencies.stdev();
        run.stdevs.push(stdev);
        debug!(?packet, ?delay, mean, stdev, "received reply");
        let received = Received {
            packet,
            from,
            size,
            delay,
            at: now,
        };
        for observer in self.observers.iter_mut() {
            observer.on_receive(&received);
        }

        // Query predictor
        if run.pacer.mode() != Mode::Adaptive || !run.means.is_full() {
            return;
        }
        let history = history(run);
        match self.predictor.predict(&history) {
            Ok(ratio) => {
                debug!(ratio, previous = run.ratio, "updated bandwidth ratio");
                run.ratio = ratio;
                self.metrics.ratio.set(ratio);
                self.metrics.prediction(metrics::Outcome::Success);
            }
            Err(err) => {
                warn!(?err, ratio = run.ratio, "predictor failed, keeping ratio");
                self.metrics.prediction((&err).into());
            }
        }
    }

    /// Stop generating traffic, cancelling the outstanding send timer.
    pub fn stop(&mut self) {
        let Some(mut run) = self.run.take() else {
            return;
        };
        if let Some(timer) = run.timer.take() {
            self.context.cancel(timer);
        }
        info!(sent = run.sent, pending = run.pending.len(), "stopped generator");
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    /// Pacing mode, fixed by the configured interval mean.
    pub fn mode(&self) -> Mode {
        Mode::from_interval_mean(self.cfg.interval_mean)
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn context(&self) -> &E {
        &self.context
    }

    /// Current bandwidth ratio (unclamped), if running.
    pub fn ratio(&self) -> Option<f64> {
        self.run.as_ref().map(|run| run.ratio)
    }

    /// Number of packets sent in this run, if running.
    pub fn sent(&self) -> Option<u64> {
        self.run.as_ref().map(|run| run.sent)
    }

    /// Number of packets awaiting a reply, if running.
    pub fn pending(&self) -> Option<usize> {
        self.run.as_ref().map(|run| run.pending.len())
    }

    /// Raw latency window, if running.
    pub fn latencies(&self) -> Option<&Window> {
        self.run.as_ref().map(|run| &run.latencies)
    }

    /// Rolling mean window, if running.
    pub fn means(&self) -> Option<&Window> {
        self.run.as_ref().map(|run| &run.means)
    }

    /// Rolling standard deviation window, if running.
    pub fn stdevs(&self) -> Option<&Window> {
        self.run.as_ref().map(|run| &run.stdevs)
    }

    /// History that would be handed to the predictor (oldest first), if running.
    pub fn history(&self) -> Option<Vec<Sample>> {
        self.run.as_ref().map(history)
    }
}

fn history<H>(run: &Run<H>) -> Vec<Sample> {
    run.means
        .iter()
        .zip(run.stdevs.iter())
        .zip(run.latencies.iter())
        .map(|((&mean, &stdev), &latency)| Sample {
            mean,
            stdev,
            latency,
        })
        .collect()
}
