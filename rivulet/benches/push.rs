//! Microbenchmarks for the push and query paths.
//!
//! Run with: `cargo bench -p rivulet -- push`

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use rivulet::matcher::Selector;
use rivulet::query::{QueryContext, QueryRequest, QueryResponse};
use rivulet::{Entry, Instance, InstanceConfig, Matcher, PushRequest, PushStream};

const BASE: u64 = 1_700_000_000_000_000_000;

fn instance() -> Instance {
    let cfg = InstanceConfig {
        max_streams_per_user: 0,
        ..InstanceConfig::default()
    };
    Instance::from_config(cfg, "bench")
}

fn request(stream_count: u32, ts: u64) -> PushRequest {
    PushRequest {
        streams: (0..stream_count)
            .map(|i| {
                let pod = format!("pod-{i}");
                PushStream::new(
                    &[("job", "bench"), ("pod", pod.as_str())],
                    vec![Entry::new(ts, "level=info msg=\"request served\" status=200")],
                )
            })
            .collect(),
    }
}

fn bench_push_single(c: &mut Criterion) {
    let instance = instance();
    let mut ts = BASE;

    c.bench_function("push/single_stream", |b| {
        b.iter(|| {
            ts += 1_000_000;
            instance.push(black_box(&request(1, ts))).unwrap();
        });
    });
}

fn bench_push_many_streams(c: &mut Criterion) {
    let mut group = c.benchmark_group("push/stream_count");

    for count in [1u32, 10, 100] {
        let instance = instance();
        let mut ts = BASE;

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                ts += 1_000_000;
                instance.push(black_box(&request(count, ts))).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_query_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("query/merge");

    for count in [10u32, 100] {
        let instance = instance();
        for step in 0..100u64 {
            instance.push(&request(count, BASE + step)).unwrap();
        }
        let req = QueryRequest::new(
            Selector::new(vec![Matcher::equal("job", "bench")]),
            0,
            u64::MAX,
        );

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let mut batches: Vec<QueryResponse> = Vec::new();
                let stats = instance
                    .query(&QueryContext::new(), black_box(&req), &mut batches)
                    .unwrap();
                black_box(stats);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_push_single,
    bench_push_many_streams,
    bench_query_merge
);
criterion_main!(benches);
