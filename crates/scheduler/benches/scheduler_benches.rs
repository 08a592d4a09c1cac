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

//! Scheduling throughput: how quickly tasks get through the books and onto worker threads, and
//! how cheap it is to arm and cancel timers that never fire (the common case for connection
//! timeouts).

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tether_common::config::SchedulerConfig;
use tether_scheduler::TaskScheduler;

fn scheduler(max_concurrent: usize) -> TaskScheduler {
    TaskScheduler::new(&SchedulerConfig {
        max_concurrent,
        thread_name_prefix: "bench-task".to_string(),
    })
    .unwrap()
}

fn schedule_and_wait(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule_and_wait");
    for batch in [16usize, 128] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let scheduler = scheduler(8);
            b.iter(|| {
                let handles: Vec<_> = (0..batch)
                    .map(|i| {
                        scheduler.schedule_now(move || {
                            black_box(i);
                            Ok(())
                        })
                    })
                    .collect();
                for handle in &handles {
                    scheduler.wait(handle).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn arm_and_cancel_timers(c: &mut Criterion) {
    let mut group = c.benchmark_group("arm_and_cancel");
    group.throughput(Throughput::Elements(1000));
    group.bench_function("1000_timers", |b| {
        let scheduler = scheduler(8);
        b.iter(|| {
            let handles: Vec<_> = (0..1000u64)
                .map(|i| scheduler.schedule_after(Duration::from_secs(60 + i), || Ok(())))
                .collect();
            for handle in &handles {
                scheduler.cancel(handle);
            }
        });
    });
    group.finish();
}

fn for_each_fan_out(c: &mut Criterion) {
    let scheduler = scheduler(8);
    c.bench_function("for_each_64", |b| {
        b.iter(|| {
            scheduler
                .for_each(0..64usize, |i| {
                    black_box(i);
                    Ok(())
                })
                .unwrap();
        });
    });
}

criterion_group!(
    benches,
    schedule_and_wait,
    arm_and_cancel_timers,
    for_each_fan_out
);
criterion_main!(benches);
