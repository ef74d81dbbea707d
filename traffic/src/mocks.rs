//! Mock implementations of host capabilities, predictors and observers for testing.

use crate::{
    generator::{Observer, Received, Sent},
    predictor::{self, Sample},
    Clock, PacketId, Scheduler, Transport,
};
use bytes::Bytes;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    io,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Scripted answer of a mock [Predictor].
#[derive(Clone, Debug)]
pub enum Response {
    Ratio(f64),
    Unavailable,
    Malformed(String),
    Timeout,
}

/// A predictor that answers from a script and records every history it was given.
///
/// Once the script is exhausted, every query fails as unavailable.
pub struct Predictor {
    responses: VecDeque<Response>,
    calls: Rc<RefCell<Vec<Vec<Sample>>>>,
}

impl Predictor {
    /// Create a predictor and the shared log of the histories it receives.
    #[allow(clippy::type_complexity)]
    pub fn new(responses: Vec<Response>) -> (Self, Rc<RefCell<Vec<Vec<Sample>>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                responses: responses.into(),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl predictor::Predictor for Predictor {
    fn predict(&mut self, history: &[Sample]) -> Result<f64, predictor::Error> {
        self.calls.borrow_mut().push(history.to_vec());
        match self.responses.pop_front() {
            Some(Response::Ratio(ratio)) => Ok(ratio),
            Some(Response::Malformed(content)) => Err(predictor::Error::Malformed(content)),
            Some(Response::Timeout) => Err(predictor::Error::Timeout(Duration::from_secs(1))),
            Some(Response::Unavailable) | None => Err(predictor::Error::MissingResult(
                io::Error::from(io::ErrorKind::NotFound),
            )),
        }
    }
}

/// Traffic observed by a [Recorder].
#[derive(Default)]
pub struct Recording {
    pub sent: Vec<Sent>,
    pub received: Vec<Received>,
}

/// An [Observer] that records everything it is notified of.
#[derive(Clone, Default)]
pub struct Recorder {
    pub recording: Rc<RefCell<Recording>>,
}

impl Observer for Recorder {
    fn on_send(&mut self, sent: &Sent) {
        self.recording.borrow_mut().sent.push(sent.clone());
    }

    fn on_receive(&mut self, received: &Received) {
        self.recording.borrow_mut().received.push(received.clone());
    }
}

/// A packet handed to a mock [Host].
#[derive(Clone, Debug)]
pub struct Transmission {
    pub packet: PacketId,
    pub peer: SocketAddr,
    pub tos: u8,
    pub size: usize,
    pub at: SystemTime,
}

struct State {
    now: SystemTime,
    rng: StdRng,
    next_timer: u64,
    timers: BTreeMap<u64, Duration>,
    cancelled: Vec<u64>,
    next_packet: u64,
    reuse: Option<PacketId>,
    transmissions: Vec<Transmission>,
}

/// A manually driven host: time only moves when told to and timers never fire on
/// their own.
///
/// Clones share the same state, so a test can keep one to drive and inspect a [Host]
/// owned by a generator.
#[derive(Clone)]
pub struct Host {
    state: Rc<RefCell<State>>,
}

impl Host {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                now: UNIX_EPOCH,
                rng: StdRng::seed_from_u64(seed),
                next_timer: 0,
                timers: BTreeMap::new(),
                cancelled: Vec::new(),
                next_packet: 0,
                reuse: None,
                transmissions: Vec::new(),
            })),
        }
    }

    /// Move the clock to `at` (measured from [UNIX_EPOCH]).
    pub fn set(&self, at: Duration) {
        self.state.borrow_mut().now = UNIX_EPOCH + at;
    }

    /// Force the next transmission to be assigned `packet`.
    pub fn reuse(&self, packet: PacketId) {
        self.state.borrow_mut().reuse = Some(packet);
    }

    /// Delays of the timers that are scheduled and not cancelled, in scheduling order.
    pub fn timers(&self) -> Vec<Duration> {
        self.state.borrow().timers.values().copied().collect()
    }

    /// Number of timers cancelled.
    pub fn cancelled(&self) -> usize {
        self.state.borrow().cancelled.len()
    }

    /// Fire the oldest outstanding timer, returning its delay.
    pub fn fire(&self) -> Option<Duration> {
        self.state
            .borrow_mut()
            .timers
            .pop_first()
            .map(|(_, delay)| delay)
    }

    pub fn transmissions(&self) -> Vec<Transmission> {
        self.state.borrow().transmissions.clone()
    }
}

impl Clock for Host {
    fn current(&self) -> SystemTime {
        self.state.borrow().now
    }
}

impl Scheduler for Host {
    type Handle = u64;

    fn schedule(&mut self, delay: Duration) -> u64 {
        let mut state = self.state.borrow_mut();
        let id = state.next_timer;
        state.next_timer += 1;
        state.timers.insert(id, delay);
        id
    }

    fn cancel(&mut self, handle: u64) -> bool {
        let mut state = self.state.borrow_mut();
        if state.timers.remove(&handle).is_none() {
            return false;
        }
        state.cancelled.push(handle);
        true
    }
}

impl Transport for Host {
    fn transmit(&mut self, peer: SocketAddr, tos: u8, payload: Bytes) -> PacketId {
        let mut state = self.state.borrow_mut();
        let packet = match state.reuse.take() {
            Some(packet) => packet,
            None => {
                let packet = PacketId(state.next_packet);
                state.next_packet += 1;
                packet
            }
        };
        let at = state.now;
        state.transmissions.push(Transmission {
            packet,
            peer,
            tos,
            size: payload.len(),
            at,
        });
        packet
    }
}

impl RngCore for Host {
    fn next_u32(&mut self) -> u32 {
        self.state.borrow_mut().rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.state.borrow_mut().rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.state.borrow_mut().rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.state.borrow_mut().rng.try_fill_bytes(dest)
    }
}
