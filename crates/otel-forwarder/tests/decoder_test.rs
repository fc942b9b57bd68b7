// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use otel_forwarder::decoder::Decoder;
use otel_forwarder::model::{find_attribute, AnyValue, Span, StatusCode};
use proptest::prelude::*;

const FIXTURE: &str = include_str!("testdata/otel.jsonl");

fn fixture_lines() -> Vec<&'static str> {
    FIXTURE.lines().collect()
}

fn span_named<'a>(spans: &'a [Span], name: &str) -> &'a Span {
    spans
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("span {name} not found"))
}

#[test]
fn test_decode_dbt_build_log() {
    let mut decoder = Decoder::new();
    let (spans, logs) = decoder.decode_lines(&fixture_lines(), 0);

    let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Invocation",
            "model.jaffle_shop.orders",
            "test.jaffle_shop.unique_orders_order_id"
        ]
    );
    // model.jaffle_shop.customers never ended
    assert_eq!(decoder.pending_spans(), 1);
    assert_eq!(logs.len(), 2);
}

#[test]
fn test_span_hierarchy_and_attributes() {
    let mut decoder = Decoder::new();
    let (spans, _) = decoder.decode_lines(&fixture_lines(), 0);

    let root = span_named(&spans, "Invocation");
    let orders = span_named(&spans, "model.jaffle_shop.orders");
    assert!(root.parent_span_id.is_empty());
    assert_eq!(orders.parent_span_id, root.span_id);
    assert_eq!(orders.trace_id, root.trace_id);
    assert_eq!(orders.trace_id.len(), 16);
    assert_eq!(orders.start_time_unix_nano, 1_717_000_001_000_000_000);
    assert_eq!(orders.end_time_unix_nano, 1_717_000_002_000_000_000);

    assert_eq!(
        find_attribute(&orders.attributes, "db.statement"),
        Some(&AnyValue::from("select * from stg_orders"))
    );
    assert_eq!(
        find_attribute(&orders.attributes, "dbt.event_type"),
        Some(&AnyValue::from("v1.public.events.fusion.node.NodeEvaluated"))
    );
    assert_eq!(
        find_attribute(&orders.attributes, "dbt.rows_affected"),
        Some(&AnyValue::Int(99))
    );
    assert_eq!(orders.status.as_ref().map(|s| s.code), Some(StatusCode::Ok));
    assert!(orders.events.is_empty());
}

#[test]
fn test_failed_test_becomes_error_span() {
    let mut decoder = Decoder::new();
    let (spans, _) = decoder.decode_lines(&fixture_lines(), 0);

    let test = span_named(&spans, "test.jaffle_shop.unique_orders_order_id");
    let status = test.status.as_ref().expect("failed test has a status");
    assert_eq!(status.code, StatusCode::Error);
    assert_eq!(
        status.message,
        "Test 'test.jaffle_shop.unique_orders_order_id' failed with 3 failing rows"
    );
    assert_eq!(test.events.len(), 1);
    assert_eq!(test.events[0].name, "exception");
    assert_eq!(test.events[0].time_unix_nano, test.end_time_unix_nano);
}

#[test]
fn test_logs_are_ordered_and_linked() {
    let mut decoder = Decoder::new();
    let (spans, logs) = decoder.decode_lines(&fixture_lines(), 0);

    assert!(logs[0].time_unix_nano < logs[1].time_unix_nano);
    assert_eq!(logs[0].severity_text, "INFO");
    assert_eq!(
        logs[0].span_id,
        span_named(&spans, "model.jaffle_shop.orders").span_id
    );
    assert_eq!(
        find_attribute(&logs[0].attributes, "dbt.node_id"),
        Some(&AnyValue::from("model.jaffle_shop.orders"))
    );
    assert_eq!(logs[1].severity_number, 17);
    assert_eq!(
        logs[1].body,
        Some(AnyValue::from("Failure in test unique_orders_order_id"))
    );
}

#[test]
fn test_cutoff_drops_earlier_records() {
    let mut decoder = Decoder::new();
    let (spans, logs) = decoder.decode_lines(&fixture_lines(), 1_717_000_003_000_000_000);

    // Records without a start or record time survive the cutoff, so the root
    // SpanEnd is kept but has nothing to pair with.
    let names: Vec<&str> = spans.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["test.jaffle_shop.unique_orders_order_id"]);
    assert_eq!(logs.len(), 1);
}

fn span_lines(order: &[usize]) -> Vec<String> {
    let mut started = vec![false; order.len()];
    order
        .iter()
        .map(|&id| {
            let span_id = format!("{id:016x}");
            let start = 1_000 + (id as u64) * 10;
            if started[id] {
                serde_json::json!({
                    "record_type": "SpanEnd",
                    "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
                    "span_id": span_id,
                    "end_time_unix_nano": (start + 5).to_string(),
                    "attributes": {"rows_affected": id},
                })
                .to_string()
            } else {
                started[id] = true;
                serde_json::json!({
                    "record_type": "SpanStart",
                    "trace_id": "4bf92f3577b34da6a3ce929d0e0e4736",
                    "span_id": span_id,
                    "span_name": format!("model.jaffle_shop.m{id}"),
                    "start_time_unix_nano": start.to_string(),
                    "attributes": {"unique_id": format!("model.jaffle_shop.m{id}")},
                })
                .to_string()
            }
        })
        .collect()
}

/// Each span id appears twice: its first occurrence is the start record.
fn interleaving() -> impl Strategy<Value = Vec<usize>> {
    (1usize..24).prop_flat_map(|n| {
        Just((0..n).flat_map(|id| [id, id]).collect::<Vec<_>>()).prop_shuffle()
    })
}

proptest! {
    #[test]
    fn test_every_started_and_ended_span_is_emitted_once(
        order in interleaving(),
        chunk_sizes in prop::collection::vec(1usize..8, 1..16),
    ) {
        let lines = span_lines(&order);
        let mut decoder = Decoder::new();
        let mut emitted = Vec::new();
        let mut remaining = lines.as_slice();
        let mut sizes = chunk_sizes.iter().cycle();
        while !remaining.is_empty() {
            let size = (*sizes.next().unwrap_or(&1)).min(remaining.len());
            let (batch, rest) = remaining.split_at(size);
            let (spans, _) = decoder.decode_lines(batch, 0);
            emitted.extend(spans);
            remaining = rest;
        }

        prop_assert_eq!(emitted.len(), order.len() / 2);
        prop_assert_eq!(decoder.pending_spans(), 0);

        let mut whole = Decoder::new().decode_lines(&lines, 0).0;
        whole.sort_by(|a, b| a.span_id.cmp(&b.span_id));
        emitted.sort_by(|a, b| a.span_id.cmp(&b.span_id));
        prop_assert_eq!(emitted, whole);
    }
}
