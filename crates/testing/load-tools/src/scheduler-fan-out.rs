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

//! Scheduler fan-out load test: runs a fixed batch of small tasks through `for_each` at
//! increasing concurrency limits and reports how throughput scales, then floods
//! `schedule_if_under_capacity` to see how often callers are turned away.
//! Note: you should run this in release mode to get decent/comparable results

use clap::Parser;
use clap_derive::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tether_common::config::SchedulerConfig;
use tether_load_tools::bench_common::{format_duration, format_throughput};
use tether_scheduler::TaskScheduler;
use tracing::info;

#[derive(Clone, Parser, Debug)]
struct Args {
    #[arg(
        long,
        help = "Min concurrency limit. Runs start here and scale up to `max_concurrent`.",
        default_value = "1"
    )]
    min_concurrent: usize,

    #[arg(long, help = "Max concurrency limit", default_value = "64")]
    max_concurrent: usize,

    #[arg(long, help = "Tasks per run", default_value = "2000")]
    tasks: usize,

    #[arg(
        long,
        help = "Time each task spends sleeping, in microseconds",
        default_value = "500"
    )]
    task_micros: u64,

    #[arg(
        long,
        help = "Callers racing schedule_if_under_capacity in the flood phase",
        default_value = "16"
    )]
    flood_callers: usize,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    debug: bool,
}

struct Results {
    concurrency: usize,
    total_time: Duration,
    per_task: Duration,
}

fn fan_out(args: &Args, concurrency: usize) -> Result<Results, eyre::Error> {
    let scheduler = TaskScheduler::new(&SchedulerConfig {
        max_concurrent: concurrency,
        thread_name_prefix: "fan-out".to_string(),
    })?;
    let task_time = Duration::from_micros(args.task_micros);
    let start_time = Instant::now();
    scheduler.for_each(0..args.tasks, move |_| {
        std::thread::sleep(task_time);
        Ok(())
    })?;
    let total_time = start_time.elapsed();
    scheduler.shutdown();
    Ok(Results {
        concurrency,
        total_time,
        per_task: total_time / args.tasks.max(1) as u32,
    })
}

fn flood(args: &Args, concurrency: usize) -> Result<(), eyre::Error> {
    let scheduler = Arc::new(TaskScheduler::new(&SchedulerConfig {
        max_concurrent: concurrency,
        thread_name_prefix: "flood".to_string(),
    })?);
    let accepted = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));
    let task_time = Duration::from_micros(args.task_micros);
    let per_caller = args.tasks / args.flood_callers.max(1);

    let start_time = Instant::now();
    let callers = (0..args.flood_callers)
        .map(|caller| {
            let scheduler = scheduler.clone();
            let accepted = accepted.clone();
            let rejected = rejected.clone();
            std::thread::Builder::new()
                .name(format!("flood-caller-{caller}"))
                .spawn(move || {
                    let mut handles = vec![];
                    for _ in 0..per_caller {
                        match scheduler.schedule_if_under_capacity(move || {
                            std::thread::sleep(task_time);
                            Ok(())
                        }) {
                            Some(handle) => {
                                accepted.fetch_add(1, Ordering::Relaxed);
                                handles.push(handle);
                            }
                            None => {
                                rejected.fetch_add(1, Ordering::Relaxed);
                                std::thread::yield_now();
                            }
                        }
                    }
                    for handle in &handles {
                        let _ = scheduler.wait(handle);
                    }
                })
        })
        .collect::<Result<Vec<_>, _>>()?;
    for caller in callers {
        caller
            .join()
            .map_err(|_| eyre::eyre!("Flood caller panicked"))?;
    }
    let total_time = start_time.elapsed();
    let accepted = accepted.load(Ordering::Relaxed);
    info!(
        "Flood @ {concurrency}: {accepted} accepted, {} rejected in {:?} ({})",
        rejected.load(Ordering::Relaxed),
        total_time,
        format_throughput(accepted, total_time)
    );
    #[cfg(debug_assertions)]
    scheduler.check_consistency()?;
    scheduler.shutdown();
    Ok(())
}

fn main() -> Result<(), eyre::Error> {
    color_eyre::install()?;
    let args: Args = Args::parse();

    tether_common::tracing::init_tracing(args.debug).unwrap_or_else(|e| {
        eprintln!("Unable to configure logging: {e}");
        std::process::exit(1);
    });
    eyre::ensure!(args.min_concurrent > 0, "--min-concurrent must be at least 1");

    info!(
        "Starting scheduler fan-out: {} tasks of {:?} each",
        args.tasks,
        Duration::from_micros(args.task_micros)
    );

    let mut results = vec![];
    let mut concurrency = args.min_concurrent as f32;
    loop {
        if concurrency > args.max_concurrent as f32 {
            break;
        }
        let r = fan_out(&args, concurrency as usize)?;
        info!(
            "@ Concurrency: {}: Total Time: {:?}, Per Task: {}, Throughput: {}",
            r.concurrency,
            r.total_time,
            format_duration(r.per_task),
            format_throughput(args.tasks, r.total_time)
        );
        results.push(r);

        // Scale up by 25% or 1, whichever is larger, so we don't get stuck on lower values.
        let mut next_concurrency = concurrency * 1.25;
        if next_concurrency as usize <= concurrency as usize {
            next_concurrency = concurrency + 1.0;
        }
        concurrency = next_concurrency;
    }

    if let (Some(first), Some(last)) = (results.first(), results.last()) {
        info!(
            "Speedup from {} to {} workers: {:.2}x",
            first.concurrency,
            last.concurrency,
            first.total_time.as_secs_f64() / last.total_time.as_secs_f64().max(f64::EPSILON)
        );
    }

    flood(&args, args.max_concurrent)?;
    Ok(())
}
