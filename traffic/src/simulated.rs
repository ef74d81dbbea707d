//! A deterministic, single-threaded host for generators.
//!
//! The [Runner] owns a virtual clock (starting at [UNIX_EPOCH]) and a queue of alarms
//! processed in (time, insertion) order. Installed [Application]s receive a [Context]
//! implementing [Clock], [Scheduler], [Transport] and [RngCore] on top of that queue.
//!
//! Every [Link] behaves like an echo peer: a transmitted packet is (optionally)
//! serialized behind earlier packets to the same peer, dropped with probability
//! `1 - success_rate`, and otherwise returned to its sender after a forward and a return
//! latency drawn from a normal distribution.
//!
//! Given the same seed, installed applications and links, a run is fully reproducible.
//!
//! # Example
//!
//! ```rust
//! use probe_traffic::{predictor::Constant, simulated, Config, Generator};
//! use prometheus_client::registry::Registry;
//! use std::time::Duration;
//!
//! let peer = "10.0.2.2:9".parse().unwrap();
//! let mut runner = simulated::Runner::new(simulated::Config::new(0));
//! runner
//!     .link(
//!         peer,
//!         simulated::Link {
//!             latency_mean: 10.0,
//!             latency_stddev: 1.0,
//!             success_rate: 1.0,
//!             bandwidth: None,
//!         },
//!     )
//!     .unwrap();
//!
//! let mut registry = Registry::default();
//! let generator = runner.install(Duration::ZERO, None, |context| {
//!     Generator::new(context, Config::new(peer), Constant(0.5), &mut registry)
//! });
//! runner.run_until(Duration::from_secs(10)).unwrap();
//! assert!(generator.borrow().sent().unwrap() > 0);
//! ```

use crate::{generator, predictor::Predictor, Clock, Generator, PacketId, Scheduler, Transport};
use bytes::Bytes;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    net::SocketAddr,
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{error, trace, warn};

/// Errors that can occur when configuring a [Runner].
#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("invalid success rate (must be in [0, 1]): {0}")]
    InvalidSuccessRate(f64),
    #[error("invalid latency (mean {0}, stddev {1})")]
    InvalidLatency(f64, f64),
    #[error("invalid bandwidth: {0}")]
    InvalidBandwidth(u64),
    #[error("stalled at {at:?} after {events} events")]
    Stalled { at: Duration, events: usize },
}

/// Describes the path to (and back from) an echo peer.
#[derive(Clone, Copy, Debug)]
pub struct Link {
    /// Mean one-way latency in milliseconds.
    pub latency_mean: f64,

    /// Standard deviation of the one-way latency in milliseconds.
    pub latency_stddev: f64,

    /// Probability of a packet making the round trip (in range [0,1]).
    pub success_rate: f64,

    /// Outbound capacity in bytes per second (`None` for unlimited).
    pub bandwidth: Option<u64>,
}

/// Default value of [Config::max_events_per_instant].
pub const DEFAULT_MAX_EVENTS_PER_INSTANT: usize = 100_000;

/// Configuration for a [Runner].
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed of the random number generator shared by the whole run.
    pub seed: u64,

    /// Maximum number of events processed without virtual time advancing.
    ///
    /// An application that keeps rescheduling itself with no delay starves every later
    /// event (including the replies it waits for). Once this many events have been
    /// processed at the same instant, [Runner::run_until] returns [Error::Stalled].
    pub max_events_per_instant: usize,
}

impl Config {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_events_per_instant: DEFAULT_MAX_EVENTS_PER_INSTANT,
        }
    }
}

/// Lifecycle entry points a [Runner] drives.
pub trait Application {
    fn start(&mut self) -> Result<(), generator::Error>;

    fn send(&mut self) -> Result<(), generator::Error>;

    fn receive(&mut self, packet: PacketId, from: SocketAddr, size: usize);

    fn stop(&mut self);
}

impl<P: Predictor> Application for Generator<Context, P> {
    fn start(&mut self) -> Result<(), generator::Error> {
        Generator::start(self)
    }

    fn send(&mut self) -> Result<(), generator::Error> {
        Generator::send(self)
    }

    fn receive(&mut self, packet: PacketId, from: SocketAddr, size: usize) {
        Generator::receive(self, packet, from, size)
    }

    fn stop(&mut self) {
        Generator::stop(self)
    }
}

/// Handle to a timer scheduled through a [Context].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Timer(u64);

#[derive(Debug)]
enum Event {
    Start,
    Send,
    Deliver {
        packet: PacketId,
        from: SocketAddr,
        size: usize,
    },
    Stop,
}

struct Alarm {
    time: SystemTime,
    id: u64,
    owner: usize,
    event: Event,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse the ordering for min-heap
        (other.time, other.id).cmp(&(self.time, self.id))
    }
}

struct World {
    now: SystemTime,
    rng: StdRng,

    next_alarm: u64,
    alarms: BinaryHeap<Alarm>,
    scheduled: HashSet<u64>,

    next_packet: u64,
    links: HashMap<SocketAddr, Link>,
    busy_until: HashMap<SocketAddr, SystemTime>,
    dropped: u64,
}

impl World {
    fn push(&mut self, time: SystemTime, owner: usize, event: Event) -> u64 {
        let id = self.next_alarm;
        self.next_alarm += 1;
        self.scheduled.insert(id);
        self.alarms.push(Alarm {
            time,
            id,
            owner,
            event,
        });
        id
    }

    fn latency(&mut self, link: &Link) -> Duration {
        let millis = Normal::new(link.latency_mean, link.latency_stddev)
            .map(|normal| normal.sample(&mut self.rng))
            .unwrap_or(link.latency_mean);
        Duration::from_secs_f64(millis.max(0.0) / 1_000.0)
    }

    fn transmit(&mut self, owner: usize, peer: SocketAddr, size: usize) -> PacketId {
        let packet = PacketId(self.next_packet);
        self.next_packet += 1;
        let Some(link) = self.links.get(&peer).copied() else {
            trace!(?packet, ?peer, "no link to peer");
            self.dropped += 1;
            return packet;
        };

        // Serialize behind earlier packets
        let mut departure = self.now;
        if let Some(bandwidth) = link.bandwidth {
            let free = self
                .busy_until
                .get(&peer)
                .copied()
                .unwrap_or(self.now)
                .max(self.now);
            departure = free + Duration::from_secs_f64(size as f64 / bandwidth as f64);
            self.busy_until.insert(peer, departure);
        }

        if !self.rng.gen_bool(link.success_rate) {
            trace!(?packet, ?peer, "dropped packet");
            self.dropped += 1;
            return packet;
        }
        let arrival = departure + self.latency(&link) + self.latency(&link);
        self.push(
            arrival,
            owner,
            Event::Deliver {
                packet,
                from: peer,
                size,
            },
        );
        packet
    }
}

/// Capabilities handed to an installed [Application].
#[derive(Clone)]
pub struct Context {
    world: Rc<RefCell<World>>,
    owner: usize,
}

impl Clock for Context {
    fn current(&self) -> SystemTime {
        self.world.borrow().now
    }
}

impl Scheduler for Context {
    type Handle = Timer;

    fn schedule(&mut self, delay: Duration) -> Timer {
        let mut world = self.world.borrow_mut();
        match world.now.checked_add(delay) {
            Some(time) => Timer(world.push(time, self.owner, Event::Send)),
            None => {
                // Beyond the representable clock: the timer never fires
                trace!(?delay, "timer beyond the end of time");
                let id = world.next_alarm;
                world.next_alarm += 1;
                Timer(id)
            }
        }
    }

    fn cancel(&mut self, handle: Timer) -> bool {
        self.world.borrow_mut().scheduled.remove(&handle.0)
    }
}

impl Transport for Context {
    fn transmit(&mut self, peer: SocketAddr, _tos: u8, payload: Bytes) -> PacketId {
        self.world
            .borrow_mut()
            .transmit(self.owner, peer, payload.len())
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.world.borrow_mut().rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.world.borrow_mut().rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.world.borrow_mut().rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.world.borrow_mut().rng.try_fill_bytes(dest)
    }
}

/// Drives installed [Application]s in virtual time.
pub struct Runner {
    world: Rc<RefCell<World>>,
    applications: Vec<Rc<RefCell<dyn Application>>>,
    max_events_per_instant: usize,
}

impl Runner {
    pub fn new(cfg: Config) -> Self {
        let world = World {
            now: UNIX_EPOCH,
            rng: StdRng::seed_from_u64(cfg.seed),
            next_alarm: 0,
            alarms: BinaryHeap::new(),
            scheduled: HashSet::new(),
            next_packet: 0,
            links: HashMap::new(),
            busy_until: HashMap::new(),
            dropped: 0,
        };
        Self {
            world: Rc::new(RefCell::new(world)),
            applications: Vec::new(),
            max_events_per_instant: cfg.max_events_per_instant,
        }
    }

    /// Create (or replace) the link to `peer`.
    pub fn link(&mut self, peer: SocketAddr, link: Link) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&link.success_rate) {
            return Err(Error::InvalidSuccessRate(link.success_rate));
        }
        if !link.latency_mean.is_finite()
            || !link.latency_stddev.is_finite()
            || link.latency_stddev < 0.0
        {
            return Err(Error::InvalidLatency(
                link.latency_mean,
                link.latency_stddev,
            ));
        }
        if link.bandwidth == Some(0) {
            return Err(Error::InvalidBandwidth(0));
        }
        self.world.borrow_mut().links.insert(peer, link);
        Ok(())
    }

    /// Install an application started at `start` and (optionally) stopped at `stop`.
    pub fn install<A, F>(&mut self, start: Duration, stop: Option<Duration>, f: F) -> Rc<RefCell<A>>
    where
        A: Application + 'static,
        F: FnOnce(Context) -> A,
    {
        let owner = self.applications.len();
        let context = Context {
            world: self.world.clone(),
            owner,
        };
        let application = Rc::new(RefCell::new(f(context)));
        self.applications.push(application.clone());

        let mut world = self.world.borrow_mut();
        let now = world.now;
        if let Some(start) = now.checked_add(start) {
            world.push(start, owner, Event::Start);
        }
        if let Some(stop) = stop.and_then(|stop| now.checked_add(stop)) {
            world.push(stop, owner, Event::Stop);
        }
        application
    }

    /// Current virtual time.
    pub fn now(&self) -> SystemTime {
        self.world.borrow().now
    }

    /// Number of packets lost so far (no link or dropped by a link).
    pub fn dropped(&self) -> u64 {
        self.world.borrow().dropped
    }

    /// Process all events due at or before `deadline` (measured from [UNIX_EPOCH]),
    /// returning the number of events processed.
    ///
    /// Fails with [Error::Stalled] (leaving the clock at the stalled instant) once
    /// [Config::max_events_per_instant] events have been processed without time
    /// advancing. Calling again resumes with a fresh budget.
    pub fn run_until(&mut self, deadline: Duration) -> Result<usize, Error> {
        let deadline = UNIX_EPOCH.checked_add(deadline);
        let mut processed = 0;
        let mut instant = None;
        let mut events = 0;
        loop {
            let alarm = {
                let mut world = self.world.borrow_mut();
                let time = match world.alarms.peek() {
                    Some(next) if deadline.map_or(true, |deadline| next.time <= deadline) => {
                        next.time
                    }
                    _ => break,
                };
                if instant == Some(time) {
                    if events >= self.max_events_per_instant {
                        let at = time.duration_since(UNIX_EPOCH).unwrap_or_default();
                        warn!(?at, events, "simulation stalled");
                        return Err(Error::Stalled { at, events });
                    }
                } else {
                    instant = Some(time);
                    events = 0;
                }
                let Some(alarm) = world.alarms.pop() else {
                    break;
                };
                if !world.scheduled.remove(&alarm.id) {
                    continue;
                }
                world.now = alarm.time;
                alarm
            };
            processed += 1;
            events += 1;

            let application = self.applications[alarm.owner].clone();
            let mut application = application.borrow_mut();
            match alarm.event {
                Event::Start => {
                    if let Err(err) = application.start() {
                        error!(owner = alarm.owner, ?err, "failed to start application");
                    }
                }
                Event::Send => {
                    if let Err(err) = application.send() {
                        error!(owner = alarm.owner, ?err, "application halted");
                        application.stop();
                    }
                }
                Event::Deliver { packet, from, size } => application.receive(packet, from, size),
                Event::Stop => application.stop(),
            }
        }

        if let Some(deadline) = deadline {
            let mut world = self.world.borrow_mut();
            if world.now < deadline {
                world.now = deadline;
            }
        }
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "10.0.2.2:9".parse().unwrap()
    }

    #[derive(Default)]
    struct Echo {
        started: bool,
        stopped: bool,
        received: Vec<(PacketId, SystemTime)>,
    }

    struct Pinger {
        context: Context,
        sends: usize,
        echo: Rc<RefCell<Echo>>,
    }

    impl Application for Pinger {
        fn start(&mut self) -> Result<(), generator::Error> {
            self.echo.borrow_mut().started = true;
            self.context.schedule(Duration::ZERO);
            Ok(())
        }

        fn send(&mut self) -> Result<(), generator::Error> {
            self.context.transmit(peer(), 0, Bytes::from_static(b"ping"));
            self.sends += 1;
            if self.sends < 3 {
                self.context.schedule(Duration::from_secs(1));
            }
            Ok(())
        }

        fn receive(&mut self, packet: PacketId, _from: SocketAddr, _size: usize) {
            let now = self.context.current();
            self.echo.borrow_mut().received.push((packet, now));
        }

        fn stop(&mut self) {
            self.echo.borrow_mut().stopped = true;
        }
    }

    fn install(runner: &mut Runner, stop: Option<Duration>) -> Rc<RefCell<Echo>> {
        let echo = Rc::new(RefCell::new(Echo::default()));
        let shared = echo.clone();
        runner.install(Duration::from_secs(1), stop, move |context| Pinger {
            context,
            sends: 0,
            echo: shared,
        });
        echo
    }

    #[test]
    fn test_invalid_links() {
        let mut runner = Runner::new(Config::new(0));
        let link = Link {
            latency_mean: 1.0,
            latency_stddev: 0.0,
            success_rate: 1.0,
            bandwidth: None,
        };
        assert_eq!(
            runner.link(
                peer(),
                Link {
                    success_rate: 1.5,
                    ..link
                }
            ),
            Err(Error::InvalidSuccessRate(1.5))
        );
        assert!(runner
            .link(
                peer(),
                Link {
                    latency_stddev: -1.0,
                    ..link
                }
            )
            .is_err());
        assert_eq!(
            runner.link(
                peer(),
                Link {
                    bandwidth: Some(0),
                    ..link
                }
            ),
            Err(Error::InvalidBandwidth(0))
        );
        assert!(runner.link(peer(), link).is_ok());
    }

    #[test]
    fn test_echo_latency() {
        let mut runner = Runner::new(Config::new(0));
        runner
            .link(
                peer(),
                Link {
                    latency_mean: 5.0,
                    latency_stddev: 0.0,
                    success_rate: 1.0,
                    bandwidth: None,
                },
            )
            .unwrap();
        let echo = install(&mut runner, None);
        runner.run_until(Duration::from_secs(10)).unwrap();

        let echo = echo.borrow();
        assert!(echo.started);
        assert!(!echo.stopped);
        let expected = [1_010, 2_010, 3_010]
            .map(|millis| UNIX_EPOCH + Duration::from_millis(millis));
        let received: Vec<_> = echo.received.iter().map(|(_, at)| *at).collect();
        assert_eq!(received, expected);
        assert_eq!(runner.now(), UNIX_EPOCH + Duration::from_secs(10));
    }

    #[test]
    fn test_bandwidth_serializes() {
        let mut runner = Runner::new(Config::new(0));
        runner
            .link(
                peer(),
                Link {
                    latency_mean: 0.0,
                    latency_stddev: 0.0,
                    success_rate: 1.0,
                    bandwidth: Some(4),
                },
            )
            .unwrap();
        let echo = install(&mut runner, None);
        runner.run_until(Duration::from_secs(10)).unwrap();

        // 4 bytes at 4 bytes/s take one second to leave
        let echo = echo.borrow();
        assert_eq!(echo.received[0].1, UNIX_EPOCH + Duration::from_secs(2));
    }

    #[test]
    fn test_loss_and_missing_link() {
        let mut runner = Runner::new(Config::new(0));
        runner
            .link(
                peer(),
                Link {
                    latency_mean: 1.0,
                    latency_stddev: 0.0,
                    success_rate: 0.0,
                    bandwidth: None,
                },
            )
            .unwrap();
        let echo = install(&mut runner, None);
        runner.run_until(Duration::from_secs(10)).unwrap();
        assert!(echo.borrow().received.is_empty());
        assert_eq!(runner.dropped(), 3);

        let mut runner = Runner::new(Config::new(0));
        let echo = install(&mut runner, None);
        runner.run_until(Duration::from_secs(10)).unwrap();
        assert!(echo.borrow().received.is_empty());
        assert_eq!(runner.dropped(), 3);
    }

    #[test]
    fn test_stop_and_deadline() {
        let mut runner = Runner::new(Config::new(0));
        runner
            .link(
                peer(),
                Link {
                    latency_mean: 1.0,
                    latency_stddev: 0.0,
                    success_rate: 1.0,
                    bandwidth: None,
                },
            )
            .unwrap();
        let echo = install(&mut runner, Some(Duration::from_secs(5)));

        // Nothing is due before the start time
        assert_eq!(runner.run_until(Duration::from_millis(500)), Ok(0));
        assert!(!echo.borrow().started);

        runner.run_until(Duration::from_secs(10)).unwrap();
        assert!(echo.borrow().stopped);
    }

    #[test]
    fn test_cancel() {
        let mut runner = Runner::new(Config::new(0));
        let echo = install(&mut runner, None);
        let mut context = Context {
            world: runner.world.clone(),
            owner: 0,
        };
        let timer = context.schedule(Duration::from_secs(2));
        assert!(context.cancel(timer));
        assert!(!context.cancel(timer));
        runner.run_until(Duration::from_secs(10)).unwrap();
        assert!(echo.borrow().started);
    }

    struct Spinner {
        context: Context,
        sends: Rc<RefCell<usize>>,
    }

    impl Application for Spinner {
        fn start(&mut self) -> Result<(), generator::Error> {
            self.context.schedule(Duration::ZERO);
            Ok(())
        }

        fn send(&mut self) -> Result<(), generator::Error> {
            *self.sends.borrow_mut() += 1;
            self.context.schedule(Duration::ZERO);
            Ok(())
        }

        fn receive(&mut self, _packet: PacketId, _from: SocketAddr, _size: usize) {}

        fn stop(&mut self) {}
    }

    #[test]
    fn test_schedule_beyond_clock() {
        let mut runner = Runner::new(Config::new(0));
        let echo = install(&mut runner, None);
        let mut context = Context {
            world: runner.world.clone(),
            owner: 0,
        };
        let timer = context.schedule(Duration::MAX);
        assert!(!context.cancel(timer));
        assert_eq!(runner.run_until(Duration::MAX), Ok(4));
        assert!(echo.borrow().started);

        // Applications that would start beyond the clock never do
        let echo = Rc::new(RefCell::new(Echo::default()));
        let shared = echo.clone();
        runner.install(Duration::MAX, Some(Duration::MAX), move |context| Pinger {
            context,
            sends: 0,
            echo: shared,
        });
        assert_eq!(runner.run_until(Duration::MAX), Ok(0));
        assert!(!echo.borrow().started);
    }

    #[test]
    fn test_stalled() {
        let mut cfg = Config::new(0);
        cfg.max_events_per_instant = 100;
        let mut runner = Runner::new(cfg);
        let sends = Rc::new(RefCell::new(0));
        let shared = sends.clone();
        runner.install(Duration::from_secs(1), None, move |context| Spinner {
            context,
            sends: shared,
        });
        assert_eq!(
            runner.run_until(Duration::from_secs(10)),
            Err(Error::Stalled {
                at: Duration::from_secs(1),
                events: 100
            })
        );
        assert_eq!(*sends.borrow(), 99);
        assert_eq!(runner.now(), UNIX_EPOCH + Duration::from_secs(1));

        // Resuming grants a fresh budget at the same instant
        assert!(runner.run_until(Duration::from_secs(10)).is_err());
        assert_eq!(*sends.borrow(), 199);
    }
}
