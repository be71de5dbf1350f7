//! Drive a random transfer workload through a fair-share controller and report what happened.

use clap::{value_parser, Arg, ArgAction, Command};
use fairshare::{deterministic::Executor, Completion, Config, Controller, PeerId};
use prometheus_client::{encoding::text::encode, registry::Registry};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal, Normal};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, info, Level};

/// Mean and standard deviation of pairwise latency in milliseconds.
const LATENCY_MEAN: f64 = 50.0;
const LATENCY_STDDEV: f64 = 15.0;

/// Parameters of the log-normal message size distribution (median of roughly 3 KB).
const SIZE_MU: f64 = 8.0;
const SIZE_SIGMA: f64 = 1.5;

/// Largest gap between two sends in milliseconds.
const MAX_SEND_GAP: u64 = 200;

/// Command line arguments parsed from user input
struct Arguments {
    peers: usize,
    messages: u64,
    seed: u64,
    capacity: u64,
    disconnect: f64,
    full: bool,
    verbose: bool,
    metrics: bool,
}

/// Outcome of all messages sent.
#[derive(Default)]
struct Report {
    delivered: u64,
    dropped: u64,
    bytes: u64,
    elapsed: Duration,
    sent_at: BTreeMap<u64, SystemTime>,
}

impl Report {
    fn record(&mut self, completion: Completion<u64>) {
        let sent_at = self
            .sent_at
            .remove(&completion.message)
            .expect("completion for unknown message");
        let Some(deliver_at) = completion.deliver_at else {
            self.dropped += 1;
            return;
        };
        self.delivered += 1;
        self.bytes += completion.size;
        self.elapsed += deliver_at.duration_since(sent_at).unwrap_or_default();
    }
}

fn parse_arguments() -> Arguments {
    let matches = Command::new("fairshare-churn")
        .about("Drive a random transfer workload through a max-min fair bandwidth controller")
        .arg(
            Arg::new("peers")
                .long("peers")
                .default_value("64")
                .value_parser(value_parser!(usize))
                .help("Number of simulated peers"),
        )
        .arg(
            Arg::new("messages")
                .long("messages")
                .default_value("2000")
                .value_parser(value_parser!(u64))
                .help("Number of messages to send"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .help("Seed of the workload"),
        )
        .arg(
            Arg::new("capacity")
                .long("capacity")
                .default_value("100000")
                .value_parser(value_parser!(u64).range(1..))
                .help("Largest upload or download capacity of a peer in bytes per second"),
        )
        .arg(
            Arg::new("disconnect")
                .long("disconnect")
                .default_value("0.01")
                .value_parser(value_parser!(f64))
                .help("Probability of disconnecting a random peer after each send"),
        )
        .arg(
            Arg::new("full")
                .long("full")
                .action(ArgAction::SetTrue)
                .help("Reallocate every flow on every event instead of the affected ones"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Log every flow event"),
        )
        .arg(
            Arg::new("metrics")
                .long("metrics")
                .action(ArgAction::SetTrue)
                .help("Print metrics in the Prometheus text format when done"),
        )
        .get_matches();

    let disconnect = *matches.get_one::<f64>("disconnect").unwrap();
    assert!(
        (0.0..=1.0).contains(&disconnect),
        "disconnect probability must be in [0, 1]"
    );
    Arguments {
        peers: *matches.get_one::<usize>("peers").unwrap(),
        messages: *matches.get_one::<u64>("messages").unwrap(),
        seed: *matches.get_one::<u64>("seed").unwrap(),
        capacity: *matches.get_one::<u64>("capacity").unwrap(),
        disconnect,
        full: matches.get_flag("full"),
        verbose: matches.get_flag("verbose"),
        metrics: matches.get_flag("metrics"),
    }
}

fn main() {
    // Parse arguments
    let args = parse_arguments();

    // Create logger
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .init();

    // Create controller
    let registry = Arc::new(Mutex::new(Registry::default()));
    let cfg = Config {
        discovery: !args.full,
        registry: Some(registry.clone()),
        ..Config::default()
    };
    let mut controller: Controller<Executor, u64> = Controller::new(Executor::default(), cfg);
    let mut rng = StdRng::seed_from_u64(args.seed);

    // Register peers and link them
    let peers: Vec<PeerId> = (0..args.peers)
        .map(|_| {
            let up = rng.gen_range(1..=args.capacity);
            let down = rng.gen_range(1..=args.capacity);
            controller.register_peer(up, down)
        })
        .collect();
    let latency = Normal::new(LATENCY_MEAN, LATENCY_STDDEV).expect("valid latency distribution");
    for &src in &peers {
        for &dst in &peers {
            if src == dst {
                continue;
            }
            let ms = latency.sample(&mut rng).max(0.0) as u64;
            controller
                .set_latency(src, dst, Duration::from_millis(ms))
                .expect("peers are registered");
        }
    }
    info!(peers = peers.len(), full = args.full, "registered peers");

    // Send messages
    let sizes = LogNormal::new(SIZE_MU, SIZE_SIGMA).expect("valid size distribution");
    let mut report = Report::default();
    let mut offline = Vec::new();
    let mut now = SystemTime::UNIX_EPOCH;
    for message in 0..args.messages {
        let src = peers[rng.gen_range(0..peers.len())];
        let dst = peers[rng.gen_range(0..peers.len())];
        let size = sizes.sample(&mut rng) as u64;
        match controller.send(src, dst, message, size) {
            Ok(_) => {
                report.sent_at.insert(message, now);
            }
            Err(err) => debug!(%src, %dst, ?err, "send rejected"),
        }

        // Churn
        if rng.gen_bool(args.disconnect) {
            let peer = peers[rng.gen_range(0..peers.len())];
            let dropped = controller
                .disconnect_peer(peer)
                .expect("peers are registered");
            debug!(%peer, dropped = dropped.len(), "peer left");
            for completion in dropped {
                report.record(completion);
            }
            offline.push(peer);
        }
        if !offline.is_empty() && rng.gen_bool(0.1) {
            let peer = offline.swap_remove(rng.gen_range(0..offline.len()));
            controller
                .reconnect_peer(peer)
                .expect("peers are registered");
            debug!(%peer, "peer rejoined");
        }

        // Advance time
        now += Duration::from_millis(rng.gen_range(0..MAX_SEND_GAP));
        for completion in controller.run_until(now) {
            report.record(completion);
        }
    }
    for completion in controller.run() {
        report.record(completion);
    }

    // Summarize
    let stats = controller.stats();
    let mean = report
        .elapsed
        .checked_div(u32::try_from(report.delivered).unwrap_or(u32::MAX))
        .unwrap_or_default();
    info!(
        delivered = report.delivered,
        dropped = report.dropped,
        stalled = report.sent_at.len(),
        bytes = report.bytes,
        mean_ms = mean.as_millis() as u64,
        "workload finished"
    );
    info!(
        flows = stats.flows_created,
        bursts = stats.bursts,
        reallocations = stats.reallocations,
        affected_per_reallocation = stats
            .affected_flows
            .checked_div(stats.reallocations)
            .unwrap_or_default(),
        widenings = stats.widenings,
        "controller stats"
    );
    if args.metrics {
        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).expect("encoding metrics");
        println!("{buffer}");
    }
}
