//! Run probe traffic generators against a simulated echo peer.
//!
//! One adaptive generator competes with a configurable number of noise generators for
//! the same link. The adaptive generator is paced by an external predictor program
//! (or a constant ratio when none is given).

use clap::{value_parser, Arg, ArgAction, Command};
use probe_traffic::{
    predictor::{
        self,
        process::{self, Process},
        Constant, Sample,
    },
    simulated::{self, Link, Runner},
    Config, Generator, Observer, Received, Sent,
};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{cell::Cell, net::SocketAddr, path::PathBuf, rc::Rc, time::Duration};
use tracing::{error, info, Level};

/// Address of the echo peer.
const PEER: &str = "10.0.2.2:9";

/// Time at which the generators are started.
const START: Duration = Duration::from_secs(1);

/// Predictor used by the adaptive generator.
enum Pacing {
    Process(Process),
    Constant(Constant),
}

impl predictor::Predictor for Pacing {
    fn predict(&mut self, history: &[Sample]) -> Result<f64, predictor::Error> {
        match self {
            Pacing::Process(process) => process.predict(history),
            Pacing::Constant(constant) => constant.predict(history),
        }
    }
}

/// Counts the traffic of a single generator.
#[derive(Clone, Default)]
struct Tally {
    sent: Rc<Cell<u64>>,
    received: Rc<Cell<u64>>,
    bytes: Rc<Cell<u64>>,
}

impl Observer for Tally {
    fn on_send(&mut self, sent: &Sent) {
        self.sent.set(self.sent.get() + 1);
        self.bytes.set(self.bytes.get() + sent.size as u64);
    }

    fn on_receive(&mut self, _: &Received) {
        self.received.set(self.received.get() + 1);
    }
}

struct Arguments {
    seed: u64,
    max_events: usize,
    duration: Duration,
    noise: usize,
    interval_mean: f64,
    size_mean: f64,
    size_variance: f64,
    view_size: usize,
    max_packets: u64,
    link: Link,
    pacing: Pacing,
    level: Level,
}

fn main() {
    let args = parse_arguments();
    tracing_subscriber::fmt().with_max_level(args.level).init();

    let peer: SocketAddr = PEER.parse().expect("invalid peer");
    let mut cfg = simulated::Config::new(args.seed);
    cfg.max_events_per_instant = args.max_events;
    let mut runner = Runner::new(cfg);
    runner.link(peer, args.link).expect("invalid link");

    // Install generators
    let mut registry = Registry::default();
    let end = START.saturating_add(args.duration);
    let stop = Some(end);
    let mut cfg = Config::new(peer);
    cfg.interval_mean = 0.0;
    cfg.view_size = args.view_size;
    cfg.max_packets = args.max_packets;
    cfg.packet_size_mean = args.size_mean;
    cfg.packet_size_variance = args.size_variance;
    let pacing = args.pacing;
    let mut tallies = Vec::with_capacity(args.noise + 1);
    let tally = Tally::default();
    tallies.push(("adaptive".to_string(), tally.clone()));
    runner.install(START, stop, |context| {
        let mut generator = Generator::new(
            context,
            cfg,
            pacing,
            registry.sub_registry_with_label(("generator".into(), "adaptive".into())),
        );
        generator.register(Box::new(tally));
        generator
    });
    for i in 0..args.noise {
        let mut cfg = Config::new(peer);
        cfg.interval_mean = args.interval_mean;
        cfg.packet_size_mean = args.size_mean;
        cfg.packet_size_variance = args.size_variance;
        cfg.view_size = args.view_size;
        let label = format!("noise-{i}");
        let tally = Tally::default();
        tallies.push((label.clone(), tally.clone()));
        runner.install(START, stop, |context| {
            let mut generator = Generator::new(
                context,
                cfg,
                Constant(0.0),
                registry.sub_registry_with_label(("generator".into(), label.into())),
            );
            generator.register(Box::new(tally));
            generator
        });
    }
    info!(
        seed = args.seed,
        noise = args.noise,
        duration = ?args.duration,
        "starting simulation"
    );

    // Run simulation
    match runner.run_until(end.saturating_add(Duration::from_secs(1))) {
        Ok(processed) => info!(processed, dropped = runner.dropped(), "simulation complete"),
        Err(err) => error!(?err, dropped = runner.dropped(), "simulation aborted"),
    }

    // Report results
    for (generator, tally) in &tallies {
        let sent = tally.sent.get();
        let received = tally.received.get();
        let loss = if sent == 0 {
            0.0
        } else {
            1.0 - received as f64 / sent as f64
        };
        info!(
            generator = %generator,
            sent,
            received,
            bytes = tally.bytes.get(),
            loss,
            "generator totals"
        );
    }
    let mut buffer = String::new();
    encode(&mut buffer, &registry).expect("failed to encode metrics");
    println!("{buffer}");
}

fn parse_arguments() -> Arguments {
    let matches = Command::new("probe-simulator")
        .about("Run probe traffic generators against a simulated echo peer")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .help("Seed of the simulation"),
        )
        .arg(
            Arg::new("max-events")
                .long("max-events")
                .default_value("100000")
                .value_parser(value_parser!(usize))
                .help("Maximum events processed at a single instant before aborting"),
        )
        .arg(
            Arg::new("duration")
                .long("duration")
                .default_value("60")
                .value_parser(value_parser!(u64))
                .help("Duration of the simulation in seconds"),
        )
        .arg(
            Arg::new("noise")
                .long("noise")
                .default_value("2")
                .value_parser(value_parser!(usize))
                .help("Number of noise generators sharing the link"),
        )
        .arg(
            Arg::new("interval-mean")
                .long("interval-mean")
                .default_value("0.1")
                .value_parser(value_parser!(f64))
                .help("Mean interval of noise generators in seconds"),
        )
        .arg(
            Arg::new("size-mean")
                .long("size-mean")
                .default_value("1024")
                .value_parser(value_parser!(f64))
                .help("Mean packet size in bytes"),
        )
        .arg(
            Arg::new("size-variance")
                .long("size-variance")
                .default_value("1024")
                .value_parser(value_parser!(f64))
                .help("Variance of the packet size"),
        )
        .arg(
            Arg::new("view-size")
                .long("view-size")
                .default_value("20")
                .value_parser(value_parser!(usize))
                .help("Number of samples in each rolling window"),
        )
        .arg(
            Arg::new("max-packets")
                .long("max-packets")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .help("Maximum packets sent by the adaptive generator (0 for unbounded)"),
        )
        .arg(
            Arg::new("latency")
                .long("latency")
                .default_value("15")
                .value_parser(value_parser!(f64))
                .help("Mean one-way latency in milliseconds"),
        )
        .arg(
            Arg::new("jitter")
                .long("jitter")
                .default_value("2")
                .value_parser(value_parser!(f64))
                .help("Standard deviation of the one-way latency in milliseconds"),
        )
        .arg(
            Arg::new("success-rate")
                .long("success-rate")
                .default_value("1.0")
                .value_parser(value_parser!(f64))
                .help("Probability of a packet completing the round trip"),
        )
        .arg(
            Arg::new("bandwidth")
                .long("bandwidth")
                .value_parser(value_parser!(u64))
                .help("Link capacity in bytes per second (unlimited if omitted)"),
        )
        .arg(
            Arg::new("predictor")
                .long("predictor")
                .value_parser(value_parser!(PathBuf))
                .help("Predictor program invoked on every full window"),
        )
        .arg(
            Arg::new("predictor-arg")
                .long("predictor-arg")
                .action(ArgAction::Append)
                .value_parser(value_parser!(String))
                .help("Argument passed to the predictor before the history (repeatable)"),
        )
        .arg(
            Arg::new("result-file")
                .long("result-file")
                .default_value(process::DEFAULT_RESULT)
                .value_parser(value_parser!(PathBuf))
                .help("File the predictor writes its answer to"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value("5000")
                .value_parser(value_parser!(u64))
                .help("Predictor timeout in milliseconds"),
        )
        .arg(
            Arg::new("ratio")
                .long("ratio")
                .default_value("0.5")
                .value_parser(value_parser!(f64))
                .help("Constant bandwidth ratio used when no predictor is given"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level))
                .help("Maximum level of emitted logs"),
        )
        .get_matches();

    let pacing = match matches.get_one::<PathBuf>("predictor") {
        Some(program) => {
            let mut cfg = process::Config::new(program.clone());
            cfg.args = matches
                .get_many::<String>("predictor-arg")
                .map(|args| args.cloned().collect())
                .unwrap_or_default();
            cfg.result = matches.get_one::<PathBuf>("result-file").unwrap().clone();
            cfg.timeout = Duration::from_millis(*matches.get_one::<u64>("timeout").unwrap());
            Pacing::Process(Process::new(cfg))
        }
        None => Pacing::Constant(Constant(*matches.get_one::<f64>("ratio").unwrap())),
    };

    Arguments {
        seed: *matches.get_one("seed").unwrap(),
        max_events: *matches.get_one("max-events").unwrap(),
        duration: Duration::from_secs(*matches.get_one("duration").unwrap()),
        noise: *matches.get_one("noise").unwrap(),
        interval_mean: *matches.get_one("interval-mean").unwrap(),
        size_mean: *matches.get_one("size-mean").unwrap(),
        size_variance: *matches.get_one("size-variance").unwrap(),
        view_size: *matches.get_one("view-size").unwrap(),
        max_packets: *matches.get_one("max-packets").unwrap(),
        link: Link {
            latency_mean: *matches.get_one("latency").unwrap(),
            latency_stddev: *matches.get_one("jitter").unwrap(),
            success_rate: *matches.get_one("success-rate").unwrap(),
            bandwidth: matches.get_one("bandwidth").copied(),
        },
        pacing,
        level: *matches.get_one("log-level").unwrap(),
    }
}
