//! Integration tests for the push path: stream identity, admission,
//! partial failures and chunk transfer.

use std::sync::Arc;
use std::thread;

use rivulet::chunk::{Chunk, MemChunk};
use rivulet::error::{LimitError, RivuletError, StreamError};
use rivulet::query::{SeriesRequest, QueryContext, QueryRequest, QueryResponse};
use rivulet::matcher::Selector;
use rivulet::{Direction, Entry, Instance, InstanceConfig, Matcher, PushRequest, PushStream};

const BASE: u64 = 1_700_000_000_000_000_000;
const SEC: u64 = 1_000_000_000;

fn push_one(instance: &Instance, labels: &[(&str, &str)], entries: Vec<Entry>) -> rivulet::Result<()> {
    instance.push(&PushRequest {
        streams: vec![PushStream::new(labels, entries)],
    })
}

fn all_entries(instance: &Instance) -> Vec<Entry> {
    let req = QueryRequest::new(Selector::default(), 0, u64::MAX);
    let mut batches: Vec<QueryResponse> = Vec::new();
    instance
        .query(&QueryContext::new(), &req, &mut batches)
        .unwrap();
    batches
        .into_iter()
        .flat_map(|b| b.streams)
        .flat_map(|s| s.entries)
        .collect()
}

#[test]
fn test_new_streams_increase_counters_exactly() {
    let instance = Instance::from_config(InstanceConfig::default(), "tenant");

    instance
        .push(&PushRequest {
            streams: vec![
                PushStream::new(&[("job", "a")], vec![Entry::new(BASE, "1")]),
                PushStream::new(&[("job", "b")], vec![Entry::new(BASE, "2")]),
                PushStream::new(&[("job", "c")], vec![Entry::new(BASE, "3")]),
                // Same label set as the first stream.
                PushStream::new(&[("job", "a")], vec![Entry::new(BASE + SEC, "4")]),
            ],
        })
        .unwrap();

    assert_eq!(instance.stream_count(), 3);
    let metrics = instance.metrics();
    assert_eq!(metrics.streams_created_total, 3);
    assert_eq!(metrics.memory_streams, 3);
    assert_eq!(metrics.memory_chunks, 3);
    assert_eq!(all_entries(&instance).len(), 4);
}

#[test]
fn test_stream_limit_rejects_with_rate_limit_status() {
    let cfg = InstanceConfig {
        max_streams_per_user: 2,
        ..InstanceConfig::default()
    };
    let instance = Instance::from_config(cfg, "tenant");

    push_one(&instance, &[("job", "a")], vec![Entry::new(BASE, "a")]).unwrap();
    push_one(&instance, &[("job", "b")], vec![Entry::new(BASE, "b")]).unwrap();

    let err = push_one(&instance, &[("job", "c")], vec![Entry::new(BASE, "c")]).unwrap_err();
    assert!(matches!(
        err,
        RivuletError::Limit(LimitError::MaxStreamsPerUser {
            limit: 2,
            current: 2,
            ..
        })
    ));
    assert_eq!(err.status_code(), 429);
    assert_eq!(instance.stream_count(), 2);

    // Existing streams stay pushable.
    push_one(&instance, &[("job", "a")], vec![Entry::new(BASE + SEC, "a2")]).unwrap();
    push_one(&instance, &[("job", "b")], vec![Entry::new(BASE + SEC, "b2")]).unwrap();
    assert_eq!(all_entries(&instance).len(), 4);
}

#[test]
fn test_out_of_order_push_keeps_in_order_entries() {
    let instance = Instance::from_config(InstanceConfig::default(), "tenant");
    push_one(&instance, &[("job", "a")], vec![Entry::new(BASE + 10 * SEC, "first")]).unwrap();

    let err = push_one(
        &instance,
        &[("job", "a")],
        vec![
            Entry::new(BASE, "too old"),
            Entry::new(BASE + 11 * SEC, "fine"),
        ],
    )
    .unwrap_err();

    assert_eq!(err.status_code(), 400);
    let RivuletError::Stream(StreamError::EntriesRejected { ignored, total, .. }) = err else {
        panic!("unexpected error: {err}");
    };
    assert_eq!((ignored, total), (1, 2));

    let lines: Vec<String> = all_entries(&instance).into_iter().map(|e| e.line).collect();
    assert_eq!(lines, vec!["first", "fine"]);
}

#[test]
fn test_push_is_safe_across_threads() {
    let instance = Arc::new(Instance::from_config(InstanceConfig::default(), "tenant"));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let instance = Arc::clone(&instance);
            thread::spawn(move || {
                let name = format!("w{worker}");
                for i in 0..50u64 {
                    instance
                        .push(&PushRequest {
                            streams: vec![
                                PushStream::new(&[("worker", name.as_str())], vec![Entry::new(BASE + i, "own")]),
                                PushStream::new(&[("shared", "yes"), ("worker", name.as_str())], vec![Entry::new(BASE + i, "pair")]),
                            ],
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(instance.stream_count(), 8);
    assert_eq!(all_entries(&instance).len(), 400);

    let series = instance
        .series(&SeriesRequest {
            groups: vec![vec![Matcher::equal("shared", "yes")]],
        })
        .unwrap();
    assert_eq!(series.series.len(), 4);
}

#[test]
fn test_consume_chunk_makes_entries_queryable() {
    let instance = Instance::from_config(InstanceConfig::default(), "tenant");

    let mut chunk = MemChunk::new(1024, 4);
    for i in 0..5 {
        chunk.append(&Entry::new(BASE + i * SEC, format!("moved {i}"))).unwrap();
    }
    let bytes = chunk.encode().unwrap();

    let labels = vec![("job".to_string(), "moved".to_string())];
    instance.consume_chunk(&labels, &bytes).unwrap();
    assert_eq!(instance.metrics().memory_chunks, 1);

    // New entries continue after the transferred ones.
    push_one(&instance, &[("job", "moved")], vec![Entry::new(BASE + 10 * SEC, "live")]).unwrap();
    assert_eq!(instance.metrics().memory_chunks, 2);

    let entries = all_entries(&instance);
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[0].line, "moved 0");
    assert_eq!(entries[5].line, "live");

    assert!(instance.consume_chunk(&labels, b"\x05nope").is_err());
}

#[test]
fn test_consume_overlapping_chunk_keeps_query_order() {
    let instance = Instance::from_config(InstanceConfig::default(), "tenant");
    push_one(
        &instance,
        &[("job", "a")],
        vec![Entry::new(10, "p10"), Entry::new(20, "p20"), Entry::new(30, "p30")],
    )
    .unwrap();

    let mut chunk = MemChunk::new(1024, 4);
    chunk.append(&Entry::new(15, "c15")).unwrap();
    chunk.append(&Entry::new(25, "c25")).unwrap();
    let labels = vec![("job".to_string(), "a".to_string())];
    instance.consume_chunk(&labels, &chunk.encode().unwrap()).unwrap();
    assert_eq!(instance.stream_count(), 1);

    for (direction, expected) in [
        (Direction::Forward, vec![10, 15, 20, 25, 30]),
        (Direction::Backward, vec![30, 25, 20, 15, 10]),
    ] {
        let req = QueryRequest::new(Selector::new(vec![Matcher::equal("job", "a")]), 0, u64::MAX)
            .with_direction(direction);
        let mut batches: Vec<QueryResponse> = Vec::new();
        instance
            .query(&QueryContext::new(), &req, &mut batches)
            .unwrap();
        let got: Vec<u64> = batches
            .into_iter()
            .flat_map(|b| b.streams)
            .flat_map(|s| s.entries)
            .map(|e| e.timestamp)
            .collect();
        assert_eq!(got, expected, "{direction} order");
    }
}
