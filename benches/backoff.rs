// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Benchmarks for the backoff schedules and the engine's happy path.

use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use mulligan::backoff::{BackOffPolicy, ExponentialBackOff, FixedBackOff, UniformRandomBackOff};
use mulligan::{ClockControl, Retry};

#[derive(Debug, thiserror::Error)]
#[error("bench failure")]
struct BenchError;

fn backoff_schedules(c: &mut Criterion) {
    let control = ClockControl::new();
    let clock = control.to_clock();

    let mut group = c.benchmark_group("backoff");

    let fixed = FixedBackOff::new(Duration::from_millis(10)).with_clock(clock.clone());
    group.bench_function("fixed", |b| {
        b.iter(|| fixed.back_off(None).unwrap());
    });

    let uniform =
        UniformRandomBackOff::new(Duration::from_millis(10), Duration::from_millis(100)).with_clock(clock.clone());
    group.bench_function("uniform_random", |b| {
        b.iter(|| uniform.back_off(None).unwrap());
    });

    let exponential = ExponentialBackOff::new()
        .initial_interval(Duration::from_millis(10))
        .max_interval(Duration::from_secs(10))
        .random(true)
        .with_clock(clock);
    group.bench_function("exponential_jittered", |b| {
        b.iter_batched(
            || exponential.start(),
            |context| {
                for _ in 0..8 {
                    exponential.back_off(context.as_ref()).unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn execute_overhead(c: &mut Criterion) {
    let retry = Retry::<BenchError>::builder().build();

    c.bench_function("execute_first_attempt_success", |b| {
        b.iter(|| retry.execute(|_ctx| Ok::<_, BenchError>(1u64)).unwrap());
    });
}

criterion_group!(benches, backoff_schedules, execute_overhead);
criterion_main!(benches);
