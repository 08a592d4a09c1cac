// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Connection churn soak: worker threads repeatedly open sessions, attach and detach transports,
//! push messages through them, and then either end the session or abandon it to the eviction
//! timers. At the end the registry is left to settle and its indexes are checked.
//! Note: run this in release mode for representative latencies (consistency checks only run in
//! debug builds).

use clap::Parser;
use clap_derive::Parser;
use rand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tether_common::SessionId;
use tether_common::config::Config;
use tether_connections::{ConnectionRegistry, Delivery, RegistryEvent, SharedTransport};
use tether_load_tools::bench_common::{calculate_percentiles, format_duration, format_throughput};
use tether_load_tools::{SinkCounters, SinkTransport};
use tether_scheduler::TaskScheduler;
use tracing::{info, warn};

#[derive(Clone, Parser, Debug)]
struct Args {
    #[arg(long, help = "YAML configuration file, layered over the defaults")]
    config: Option<PathBuf>,

    #[arg(long, help = "Number of worker threads generating churn", default_value = "8")]
    workers: usize,

    #[arg(long, help = "How long to generate churn for, in seconds", default_value = "10")]
    duration_seconds: u64,

    #[arg(long, help = "Connections allocated per session", default_value = "3")]
    connections_per_session: usize,

    #[arg(long, help = "Sends attempted per attached connection", default_value = "4")]
    sends_per_connection: usize,

    #[arg(
        long,
        help = "Time each transport send takes, in microseconds",
        default_value = "0"
    )]
    send_delay_micros: u64,

    #[arg(
        long,
        help = "Chance that a session is abandoned to the eviction timers instead of ended",
        default_value = "0.1"
    )]
    abandon_probability: f64,

    #[arg(long, help = "Override registry.disconnection_seconds")]
    disconnection_seconds: Option<f64>,

    #[arg(long, help = "Override registry.stale_connection_seconds")]
    stale_connection_seconds: Option<f64>,

    #[arg(long, help = "Override scheduler.max_concurrent")]
    max_concurrent: Option<usize>,

    #[arg(
        long,
        help = "Report immediately instead of waiting for abandoned connections to be evicted",
        default_value = "false"
    )]
    no_settle: bool,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    debug: bool,
}

#[derive(Default)]
struct WorkerReport {
    sessions: usize,
    abandoned: usize,
    connections: usize,
    rejected_registrations: usize,
    delivered: usize,
    refused: usize,
    failed: usize,
    send_latencies: Vec<Duration>,
}

impl WorkerReport {
    fn merge(&mut self, other: WorkerReport) {
        self.sessions += other.sessions;
        self.abandoned += other.abandoned;
        self.connections += other.connections;
        self.rejected_registrations += other.rejected_registrations;
        self.delivered += other.delivered;
        self.refused += other.refused;
        self.failed += other.failed;
        self.send_latencies.extend(other.send_latencies);
    }
}

fn churn(
    worker: usize,
    args: &Args,
    registry: &ConnectionRegistry<String>,
    counters: &Arc<SinkCounters>,
    deadline: Instant,
) -> WorkerReport {
    let mut rng = rand::rng();
    let mut report = WorkerReport::default();
    let send_delay = Duration::from_micros(args.send_delay_micros);
    while Instant::now() < deadline {
        let session_id = SessionId::new(format!("w{worker}-s{}", report.sessions));
        report.sessions += 1;
        let connection_ids: Vec<_> = (0..args.connections_per_session)
            .map(|_| registry.allocate_connection(&session_id))
            .collect();
        report.connections += connection_ids.len();

        for connection_id in &connection_ids {
            let transport: SharedTransport<String> = Arc::new(SinkTransport::new(
                session_id.clone(),
                connection_id.clone(),
                send_delay,
                counters.clone(),
            ));
            if !registry.register_transport(transport.clone(), rng.random_bool(0.5)) {
                report.rejected_registrations += 1;
                continue;
            }
            for n in 0..args.sends_per_connection {
                let started = Instant::now();
                match registry.send_if_available(connection_id, vec![format!("message {n}")]) {
                    Delivery::Delivered => {
                        report.send_latencies.push(started.elapsed());
                        report.delivered += 1;
                    }
                    Delivery::NotAvailable(_) | Delivery::NoSuchConnection(_) => {
                        report.refused += 1;
                    }
                    Delivery::Failed(e) => {
                        warn!(%connection_id, error = %e, "Send failed");
                        report.failed += 1;
                    }
                }
            }
            registry.unregister_transport(&transport);
        }

        if rng.random_bool(args.abandon_probability) {
            report.abandoned += 1;
        } else {
            registry.session_ended(&session_id);
        }
    }
    report
}

fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args: Args = Args::parse();

    tether_common::tracing::init_tracing(args.debug).unwrap_or_else(|e| {
        eprintln!("Unable to configure logging: {e}");
        std::process::exit(1);
    });

    eyre::ensure!(
        (0.0..=1.0).contains(&args.abandon_probability),
        "--abandon-probability must be between 0 and 1"
    );
    eyre::ensure!(args.workers > 0, "--workers must be at least 1");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(seconds) = args.disconnection_seconds {
        config.registry.disconnection_seconds = seconds;
    }
    if let Some(seconds) = args.stale_connection_seconds {
        config.registry.stale_connection_seconds = seconds;
    }
    if let Some(max_concurrent) = args.max_concurrent {
        config.scheduler.max_concurrent = max_concurrent;
    }
    config.validate()?;
    info!(?config, "Starting connection churn");

    let scheduler = Arc::new(TaskScheduler::new(&config.scheduler)?);
    let registry = ConnectionRegistry::new(scheduler.clone(), config.registry.clone());
    let evictions = Arc::new(AtomicUsize::new(0));
    {
        let evictions = evictions.clone();
        registry.subscribe(move |event| {
            if matches!(event, RegistryEvent::ConnectionLost(_)) {
                evictions.fetch_add(1, Ordering::Relaxed);
            }
        });
    }
    let counters = Arc::new(SinkCounters::default());

    let start_time = Instant::now();
    let deadline = start_time + Duration::from_secs(args.duration_seconds);
    let workers = (0..args.workers)
        .map(|worker| {
            let args = args.clone();
            let registry = registry.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name(format!("churn-{worker}"))
                .spawn(move || churn(worker, &args, &registry, &counters, deadline))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut report = WorkerReport::default();
    for worker in workers {
        let worker_report = worker
            .join()
            .map_err(|_| eyre::eyre!("Churn worker panicked"))?;
        report.merge(worker_report);
    }
    let elapsed = start_time.elapsed();

    if !args.no_settle {
        let settle_time = config.registry.disconnection_timeout() + Duration::from_millis(500);
        info!("Waiting {settle_time:?} for abandoned connections to be evicted");
        std::thread::sleep(settle_time);
    }

    #[cfg(debug_assertions)]
    {
        registry.check_consistency()?;
        scheduler.check_consistency()?;
        info!("Registry and scheduler indexes are consistent");
    }

    let (p50, p95, p99, max) = calculate_percentiles(std::mem::take(&mut report.send_latencies));
    info!(
        "Churned {} sessions ({} abandoned), {} connections in {:?}: {} sessions/s",
        report.sessions,
        report.abandoned,
        report.connections,
        elapsed,
        format_throughput(report.sessions, elapsed)
    );
    info!(
        "Sends: {} delivered, {} refused, {} failed, {} rejected registrations",
        report.delivered, report.refused, report.failed, report.rejected_registrations
    );
    info!(
        "Send latency: p50 {}, p95 {}, p99 {}, max {}",
        format_duration(p50),
        format_duration(p95),
        format_duration(p99),
        format_duration(max)
    );
    info!(
        "Transports saw {} sends ({} messages), {} resets, {} logouts; {} connections evicted",
        counters.sends.load(Ordering::Relaxed),
        counters.messages.load(Ordering::Relaxed),
        counters.resets.load(Ordering::Relaxed),
        counters.logouts.load(Ordering::Relaxed),
        evictions.load(Ordering::Relaxed)
    );
    info!(registry = ?registry.stats(), scheduler = ?scheduler.stats(), "Final state");

    if !args.no_settle {
        let remaining = registry.stats();
        if remaining.connections != 0 {
            warn!(
                connections = remaining.connections,
                "Connections still tracked after settling"
            );
        }
    }

    scheduler.shutdown();
    Ok(())
}
