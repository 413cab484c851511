//! Operator chain benchmark suite.
//!
//! Measures per-item cost of push delivery through typical chains:
//! - A synchronous map/filter/scan pipeline
//! - Hub fan-out to many subscribers
//! - Concat over many small inner streams
//!
//! Run:
//!   cargo bench --bench operator_chain

#![allow(missing_docs)]
#![allow(clippy::semicolon_if_nothing_returned)]

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::cell::Cell;
use std::hint::black_box;
use std::rc::Rc;

use rivulet::config::{self, EngineConfig};
use rivulet::stream::{self, EventEmitter};
use rivulet::Hub;

fn production_config() {
    config::install(EngineConfig::production());
}

// =============================================================================
// PIPELINE
// =============================================================================

fn bench_pipeline(c: &mut Criterion) {
    production_config();
    let mut group = c.benchmark_group("operator_chain/pipeline");
    for &count in &[1_000_usize, 100_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let pipeline = stream::range(0, count)
                .map(|x| x * 3)
                .filter(|x| x % 2 == 0)
                .scan(0_i64, |total, x| total + x);
            b.iter(|| {
                let last = Rc::new(Cell::new(0_i64));
                let sink = Rc::clone(&last);
                pipeline.for_each(move |total| sink.set(total));
                black_box(last.get())
            })
        });
    }
    group.finish();
}

// =============================================================================
// FAN-OUT
// =============================================================================

fn bench_hub_fan_out(c: &mut Criterion) {
    production_config();
    let mut group = c.benchmark_group("operator_chain/hub_fan_out");
    for &subscribers in &[1_usize, 16, 256] {
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, &subscribers| {
                let hub = Hub::publish();
                let received = Rc::new(Cell::new(0_u64));
                let subscriptions: Vec<_> = (0..subscribers)
                    .map(|_| {
                        let received = Rc::clone(&received);
                        hub.stream().for_each(move |x: u64| received.set(received.get() + x))
                    })
                    .collect();
                b.iter(|| hub.next(black_box(1)));
                for subscription in subscriptions {
                    subscription.cancel();
                }
            },
        );
    }
    group.finish();
}

fn bench_concat(c: &mut Criterion) {
    production_config();
    c.bench_function("operator_chain/concat_10000", |b| {
        b.iter(|| {
            let count = Rc::new(Cell::new(0_usize));
            let sink = Rc::clone(&count);
            stream::concat((0..10_000).map(|i| stream::of([i]))).for_each(move |_| sink.set(sink.get() + 1));
            black_box(count.get())
        })
    });
}

criterion_group!(benches, bench_pipeline, bench_hub_fan_out, bench_concat);
criterion_main!(benches);
