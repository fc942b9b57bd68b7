// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rebuilds spans and logs from the dbt OpenTelemetry JSONL stream.
//!
//! dbt writes one `SpanStart` record when a unit of work begins and one
//! `SpanEnd` record when it finishes. The [`Decoder`] keeps a partial span per
//! span id until both halves have been seen, so the two records may arrive in
//! different batches. `LogRecord` lines are emitted as they are decoded.
//!
//! Malformed lines are skipped without failing the batch.

use crate::model::{
    dedup_attributes, find_attribute, AnyValue, KeyValue, LogEntry, Span, SpanEvent, Status,
    StatusCode,
};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Rewrites the attribute list of every emitted span and log.
pub type AttributeTransformer = fn(Vec<KeyValue>) -> Vec<KeyValue>;

const TEST_OUTCOME_FAILED: &str = "TEST_OUTCOME_FAILED";
const NODE_OUTCOME_SUCCESS: &str = "NODE_OUTCOME_SUCCESS";
const EXCEPTION_EVENT: &str = "exception";

/// Renames `sql` to `db.statement` and namespaces every other key under `dbt.`.
#[must_use]
pub fn default_attribute_transformer(attributes: Vec<KeyValue>) -> Vec<KeyValue> {
    attributes
        .into_iter()
        .map(|mut kv| {
            if kv.key == "sql" {
                kv.key = "db.statement".to_string();
            } else if !kv.key.starts_with("dbt.") {
                kv.key = format!("dbt.{}", kv.key);
            }
            kv
        })
        .collect()
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
#[must_use]
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum RecordType {
    SpanStart,
    SpanEnd,
    LogRecord,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    record_type: RecordType,
    #[serde(default, deserialize_with = "lenient_string")]
    trace_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    span_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    parent_span_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    span_name: Option<String>,
    /// `None` when absent; `Some(None)` when present but unparsable.
    #[serde(default, deserialize_with = "present_nanos")]
    start_time_unix_nano: Option<Option<u64>>,
    #[serde(default, deserialize_with = "lenient_nanos")]
    end_time_unix_nano: Option<u64>,
    #[serde(default, deserialize_with = "lenient_nanos")]
    time_unix_nano: Option<u64>,
    #[serde(default, deserialize_with = "lenient_nanos")]
    observed_time_unix_nano: Option<u64>,
    #[serde(default, deserialize_with = "lenient_object")]
    attributes: Option<Map<String, Value>>,
    #[serde(default, deserialize_with = "lenient_string")]
    event_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_array")]
    events: Vec<Value>,
    #[serde(default, deserialize_with = "lenient_object")]
    status: Option<Map<String, Value>>,
    #[serde(default, deserialize_with = "lenient_int")]
    severity_number: Option<i32>,
    #[serde(default, deserialize_with = "lenient_string")]
    severity_text: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    body: Option<String>,
}

impl RawRecord {
    /// Timestamp used for cutoff filtering and as the log time.
    fn record_time(&self) -> u64 {
        self.start_time_unix_nano
            .flatten()
            .or(self.time_unix_nano)
            .unwrap_or(0)
    }

    /// Record attributes in key order, followed by `event_type` when present.
    fn attributes(&self) -> Vec<KeyValue> {
        let mut attributes = self
            .attributes
            .as_ref()
            .map(json_object_to_attributes)
            .unwrap_or_default();
        if let Some(event_type) = &self.event_type {
            attributes.push(KeyValue::new("event_type", event_type.as_str()));
        }
        attributes
    }

    fn events(&self) -> Vec<SpanEvent> {
        self.events
            .iter()
            .filter_map(Value::as_object)
            .map(|event| SpanEvent {
                name: event
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                time_unix_nano: event.get("time_unix_nano").and_then(nanos_from).unwrap_or(0),
                attributes: event
                    .get("attributes")
                    .and_then(Value::as_object)
                    .map(json_object_to_attributes)
                    .unwrap_or_default(),
            })
            .collect()
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.is_empty() => Ok(Some(s)),
        _ => Ok(None),
    }
}

fn lenient_nanos<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(nanos_from(&Value::deserialize(deserializer)?))
}

fn present_nanos<'de, D>(deserializer: D) -> Result<Option<Option<u64>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() => Ok(None),
        value => Ok(Some(nanos_from(&value))),
    }
}

fn lenient_object<'de, D>(deserializer: D) -> Result<Option<Map<String, Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(Some(map)),
        _ => Ok(None),
    }
}

fn lenient_array<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Array(items) => Ok(items),
        _ => Ok(Vec::new()),
    }
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(int_from(&Value::deserialize(deserializer)?))
}

/// Nanosecond timestamps arrive as decimal strings or as JSON integers.
fn nanos_from(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Numeric fields are truncated to `i32` the way OTLP enums are sized.
#[allow(clippy::cast_possible_truncation)]
fn int_from(value: &Value) -> Option<i32> {
    value.as_f64().map(|f| f as i32)
}

fn json_object_to_attributes(map: &Map<String, Value>) -> Vec<KeyValue> {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    keys.into_iter()
        .filter_map(|k| AnyValue::from_json(&map[k]).map(|v| KeyValue::new(k.as_str(), v)))
        .collect()
}

fn string_field<'a>(map: &'a Map<String, Value>, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn decode_hex(id: &str) -> Vec<u8> {
    hex::decode(id).unwrap_or_default()
}

/// Fields merged so far for one span id.
#[derive(Debug, Default)]
struct SpanPartial {
    trace_id: String,
    parent_span_id: String,
    name: String,
    start: u64,
    end: u64,
    attributes: Vec<KeyValue>,
    events: Vec<SpanEvent>,
    status_code: StatusCode,
    status_message: String,
}

impl SpanPartial {
    fn merge_status(&mut self, status: &Map<String, Value>) {
        if let Some(code) = status.get("code").and_then(int_from) {
            if code > 0 {
                self.status_code = StatusCode::from_i32(code);
            }
        }
        let message = string_field(status, "message");
        if !message.is_empty() {
            self.status_message = message.to_string();
        }
    }

    /// An `exception` event on an unset status marks the span as failed.
    fn apply_exception_events(&mut self) {
        let Some(event) = self.events.iter().find(|e| e.name == EXCEPTION_EVENT) else {
            return;
        };
        if self.status_code == StatusCode::Unset {
            self.status_code = StatusCode::Error;
        }
        if self.status_message.is_empty() {
            if let Some(message) =
                find_attribute(&event.attributes, "exception.message").and_then(AnyValue::as_str)
            {
                self.status_message = message.to_string();
            }
        }
    }

    fn fail_with(&mut self, attributes: Vec<KeyValue>, message: String) {
        self.events.push(SpanEvent {
            name: EXCEPTION_EVENT.to_string(),
            time_unix_nano: self.end,
            attributes,
        });
        self.status_code = StatusCode::Error;
        if self.status_message.is_empty() {
            self.status_message = message;
        }
    }

    fn apply_test_outcome(&mut self, attrs: &Map<String, Value>) {
        let Some(detail) = attrs.get("node_test_detail").and_then(Value::as_object) else {
            return;
        };
        if string_field(detail, "test_outcome") != TEST_OUTCOME_FAILED {
            return;
        }
        let failing_rows = detail.get("failing_rows").and_then(int_from).unwrap_or(0);
        let unique_id = string_field(attrs, "unique_id");
        let message = if unique_id.is_empty() {
            format!("Test failed with {failing_rows} failing rows")
        } else {
            format!("Test '{unique_id}' failed with {failing_rows} failing rows")
        };

        let mut event_attrs = vec![
            KeyValue::new("exception.type", "dbt.TestFailure"),
            KeyValue::new("exception.message", message.as_str()),
        ];
        if failing_rows > 0 {
            event_attrs.push(KeyValue::new(
                "dbt.test.failing_rows",
                i64::from(failing_rows),
            ));
        }
        self.fail_with(event_attrs, message);
    }

    fn apply_node_outcome(&mut self, attrs: &Map<String, Value>) {
        let outcome = string_field(attrs, "node_outcome");
        if outcome.is_empty() || outcome == NODE_OUTCOME_SUCCESS {
            return;
        }
        let node_type = string_field(attrs, "node_type");
        let node_name = string_field(attrs, "name");
        let unique_id = string_field(attrs, "unique_id");
        let message = if node_name.is_empty() {
            format!("Node evaluation failed: {unique_id} (outcome: {outcome})")
        } else {
            format!("Node '{node_name}' evaluation failed (outcome: {outcome})")
        };

        let mut event_attrs = vec![
            KeyValue::new("exception.type", "dbt.NodeEvaluationFailure"),
            KeyValue::new("exception.message", message.as_str()),
        ];
        if !node_type.is_empty() {
            event_attrs.push(KeyValue::new("dbt.node.type", node_type));
        }
        if !unique_id.is_empty() {
            event_attrs.push(KeyValue::new("dbt.node.unique_id", unique_id));
        }
        event_attrs.push(KeyValue::new("dbt.node.outcome", outcome));
        self.fail_with(event_attrs, message);
    }

    fn build(self, span_id: &str, transformer: AttributeTransformer) -> Span {
        let status = (self.status_code != StatusCode::Unset).then(|| Status {
            code: self.status_code,
            message: self.status_message,
        });
        let end = if self.end == 0 { self.start } else { self.end };
        Span {
            trace_id: decode_hex(&self.trace_id),
            span_id: decode_hex(span_id),
            parent_span_id: decode_hex(&self.parent_span_id),
            name: self.name,
            start_time_unix_nano: self.start,
            end_time_unix_nano: end,
            attributes: dedup_attributes(transformer(dedup_attributes(self.attributes))),
            events: self.events,
            status,
            ..Span::default()
        }
    }
}

/// Stateful span and log reconstruction for a single run.
///
/// The decoder is owned by the flush loop; partial spans survive between
/// calls to [`Decoder::decode_lines`].
pub struct Decoder {
    partials: HashMap<String, SpanPartial>,
    transformer: AttributeTransformer,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_transformer(default_attribute_transformer)
    }

    #[must_use]
    pub fn with_transformer(transformer: AttributeTransformer) -> Self {
        Decoder {
            partials: HashMap::new(),
            transformer,
        }
    }

    /// Number of spans that have been seen but not yet emitted.
    #[must_use]
    pub fn pending_spans(&self) -> usize {
        self.partials.len()
    }

    /// Decodes a batch of lines. Records with a nonzero timestamp earlier than
    /// `cutoff` are dropped; a cutoff of zero keeps everything.
    ///
    /// Spans are sorted by (start time, span id) and logs by (time, span id).
    pub fn decode_lines<S: AsRef<str>>(
        &mut self,
        lines: &[S],
        cutoff: u64,
    ) -> (Vec<Span>, Vec<LogEntry>) {
        let mut spans = Vec::new();
        let mut logs = Vec::new();

        for line in lines {
            let Ok(record) = serde_json::from_str::<RawRecord>(line.as_ref()) else {
                continue;
            };
            let time = record.record_time();
            if time > 0 && time < cutoff {
                continue;
            }
            match record.record_type {
                RecordType::SpanStart | RecordType::SpanEnd => {
                    if let Some(span) = self.merge_span_record(record) {
                        spans.push(span);
                    }
                }
                RecordType::LogRecord => {
                    if let Some(log) = self.build_log(record, time) {
                        logs.push(log);
                    }
                }
                RecordType::Unknown => {}
            }
        }

        spans.sort_by(|a, b| {
            a.start_time_unix_nano
                .cmp(&b.start_time_unix_nano)
                .then_with(|| a.span_id.cmp(&b.span_id))
        });
        logs.sort_by(|a, b| {
            a.time_unix_nano
                .cmp(&b.time_unix_nano)
                .then_with(|| a.span_id.cmp(&b.span_id))
        });
        (spans, logs)
    }

    fn merge_span_record(&mut self, record: RawRecord) -> Option<Span> {
        let span_id = record.span_id.clone()?;
        let attributes = record.attributes();
        let events = record.events();

        let partial = self.partials.entry(span_id.clone()).or_default();
        if let Some(trace_id) = record.trace_id {
            partial.trace_id = trace_id;
        }
        if let Some(parent) = record.parent_span_id {
            partial.parent_span_id = parent;
        }

        if record.record_type == RecordType::SpanStart {
            if let Some(name) = record.span_name {
                partial.name = name;
            }
            if let Some(start) = record.start_time_unix_nano {
                partial.start = start.unwrap_or_else(unix_nanos_now);
            }
            partial.attributes.extend(attributes);
            partial.events.extend(events);
            return None;
        }

        if let Some(end) = record.end_time_unix_nano {
            partial.end = end;
        }
        partial.attributes.extend(attributes);
        partial.events.extend(events);
        if let Some(status) = &record.status {
            partial.merge_status(status);
        }
        partial.apply_exception_events();
        if let Some(attrs) = &record.attributes {
            partial.apply_test_outcome(attrs);
            partial.apply_node_outcome(attrs);
        }

        if partial.start == 0 {
            debug!("DECODER | SpanEnd for {} has no known start time", span_id);
            return None;
        }
        let partial = self.partials.remove(&span_id)?;
        Some(partial.build(&span_id, self.transformer))
    }

    fn build_log(&self, record: RawRecord, time: u64) -> Option<LogEntry> {
        let (Some(trace_id), Some(span_id)) = (&record.trace_id, &record.span_id) else {
            return None;
        };
        let attributes = record.attributes();
        Some(LogEntry {
            trace_id: decode_hex(trace_id),
            span_id: decode_hex(span_id),
            time_unix_nano: time,
            observed_time_unix_nano: record.observed_time_unix_nano.unwrap_or(0),
            severity_number: record.severity_number.unwrap_or(0),
            severity_text: record.severity_text.unwrap_or_default(),
            body: record.body.map(AnyValue::String),
            attributes: dedup_attributes((self.transformer)(attributes)),
        })
    }
}
