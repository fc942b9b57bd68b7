// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of decoded records into OTLP protobuf messages.

use crate::model::{AnyValue, KeyValue, LogEntry, Span, SpanEvent, SpanLink, Status};
use opentelemetry_proto::tonic::{
    common::v1::{
        any_value::Value as ProtoValue, AnyValue as ProtoAnyValue, ArrayValue,
        InstrumentationScope, KeyValue as ProtoKeyValue, KeyValueList,
    },
    logs::v1::{LogRecord, ResourceLogs, ScopeLogs},
    resource::v1::Resource,
    trace::v1::{
        span::{Event, Link},
        ResourceSpans, ScopeSpans, Span as ProtoSpan, Status as ProtoStatus,
    },
};

#[must_use]
pub fn any_value(value: &AnyValue) -> ProtoAnyValue {
    let value = match value {
        AnyValue::String(s) => ProtoValue::StringValue(s.clone()),
        AnyValue::Bool(b) => ProtoValue::BoolValue(*b),
        AnyValue::Int(i) => ProtoValue::IntValue(*i),
        AnyValue::Double(d) => ProtoValue::DoubleValue(*d),
        AnyValue::Array(values) => ProtoValue::ArrayValue(ArrayValue {
            values: values.iter().map(any_value).collect(),
        }),
        AnyValue::KvList(values) => ProtoValue::KvlistValue(KeyValueList {
            values: key_values(values),
        }),
    };
    ProtoAnyValue { value: Some(value) }
}

#[must_use]
pub fn key_values(attributes: &[KeyValue]) -> Vec<ProtoKeyValue> {
    attributes
        .iter()
        .map(|kv| ProtoKeyValue {
            key: kv.key.clone(),
            value: Some(any_value(&kv.value)),
        })
        .collect()
}

fn status(status: &Status) -> ProtoStatus {
    ProtoStatus {
        code: status.code.as_i32(),
        message: status.message.clone(),
    }
}

fn event(event: &SpanEvent) -> Event {
    Event {
        time_unix_nano: event.time_unix_nano,
        name: event.name.clone(),
        attributes: key_values(&event.attributes),
        ..Default::default()
    }
}

fn link(link: &SpanLink) -> Link {
    Link {
        trace_id: link.trace_id.clone(),
        span_id: link.span_id.clone(),
        trace_state: link.trace_state.clone(),
        attributes: key_values(&link.attributes),
        ..Default::default()
    }
}

#[must_use]
pub fn span(span: &Span) -> ProtoSpan {
    ProtoSpan {
        trace_id: span.trace_id.clone(),
        span_id: span.span_id.clone(),
        trace_state: span.trace_state.clone(),
        parent_span_id: span.parent_span_id.clone(),
        name: span.name.clone(),
        kind: span.kind.as_i32(),
        start_time_unix_nano: span.start_time_unix_nano,
        end_time_unix_nano: span.end_time_unix_nano,
        attributes: key_values(&span.attributes),
        events: span.events.iter().map(event).collect(),
        links: span.links.iter().map(link).collect(),
        status: span.status.as_ref().map(status),
        ..Default::default()
    }
}

#[must_use]
pub fn log_record(log: &LogEntry) -> LogRecord {
    LogRecord {
        time_unix_nano: log.time_unix_nano,
        observed_time_unix_nano: log.observed_time_unix_nano,
        severity_number: log.severity_number,
        severity_text: log.severity_text.clone(),
        body: log.body.as_ref().map(any_value),
        attributes: key_values(&log.attributes),
        trace_id: log.trace_id.clone(),
        span_id: log.span_id.clone(),
        ..Default::default()
    }
}

#[must_use]
pub fn resource(attributes: &[KeyValue]) -> Resource {
    Resource {
        attributes: key_values(attributes),
        ..Default::default()
    }
}

#[must_use]
pub fn scope() -> InstrumentationScope {
    InstrumentationScope {
        name: crate::APP_NAME.to_string(),
        version: crate::VERSION.to_string(),
        ..Default::default()
    }
}

/// Wraps a batch of spans into a single resource envelope.
#[must_use]
pub fn resource_spans(resource_attributes: &[KeyValue], spans: &[Span]) -> ResourceSpans {
    ResourceSpans {
        resource: Some(resource(resource_attributes)),
        scope_spans: vec![ScopeSpans {
            scope: Some(scope()),
            spans: spans.iter().map(span).collect(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Wraps a batch of log records into a single resource envelope.
#[must_use]
pub fn resource_logs(resource_attributes: &[KeyValue], logs: &[LogEntry]) -> ResourceLogs {
    ResourceLogs {
        resource: Some(resource(resource_attributes)),
        scope_logs: vec![ScopeLogs {
            scope: Some(scope()),
            log_records: logs.iter().map(log_record).collect(),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SpanKind, StatusCode};

    #[test]
    fn test_nested_values_convert() {
        let value = AnyValue::KvList(vec![
            KeyValue::new("rows", 3_i64),
            KeyValue::new("tags", AnyValue::Array(vec![AnyValue::from("a")])),
        ]);
        let Some(ProtoValue::KvlistValue(list)) = any_value(&value).value else {
            panic!("expected kvlist");
        };
        assert_eq!(list.values.len(), 2);
        assert_eq!(list.values[0].key, "rows");
        assert_eq!(
            list.values[0].value,
            Some(ProtoAnyValue {
                value: Some(ProtoValue::IntValue(3))
            })
        );
        assert!(matches!(
            list.values[1].value.as_ref().and_then(|v| v.value.as_ref()),
            Some(ProtoValue::ArrayValue(_))
        ));
    }

    #[test]
    fn test_span_envelope() {
        let spans = vec![Span {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: "model.jaffle.orders".to_string(),
            kind: SpanKind::Internal,
            start_time_unix_nano: 10,
            end_time_unix_nano: 20,
            status: Some(Status {
                code: StatusCode::Error,
                message: "boom".to_string(),
            }),
            events: vec![SpanEvent {
                name: "exception".to_string(),
                time_unix_nano: 20,
                attributes: vec![KeyValue::new("exception.type", "dbt.TestFailure")],
            }],
            ..Span::default()
        }];
        let envelope = resource_spans(&[KeyValue::new("service.name", "dbt")], &spans);

        let resource = envelope.resource.expect("resource");
        assert_eq!(resource.attributes[0].key, "service.name");
        let scope_spans = &envelope.scope_spans[0];
        let scope = scope_spans.scope.as_ref().expect("scope");
        assert_eq!(scope.name, "dbt-otel-forwarder");
        assert_eq!(scope.version, crate::VERSION);

        let span = &scope_spans.spans[0];
        assert_eq!(span.kind, 1);
        assert_eq!(span.end_time_unix_nano, 20);
        assert_eq!(span.events[0].name, "exception");
        let status = span.status.as_ref().expect("status");
        assert_eq!(status.code, 2);
        assert_eq!(status.message, "boom");
    }

    #[test]
    fn test_log_envelope() {
        let logs = vec![LogEntry {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            time_unix_nano: 5,
            severity_number: 9,
            severity_text: "INFO".to_string(),
            body: Some(AnyValue::from("hello")),
            ..LogEntry::default()
        }];
        let envelope = resource_logs(&[], &logs);
        let record = &envelope.scope_logs[0].log_records[0];
        assert_eq!(record.severity_number, 9);
        assert_eq!(record.span_id, vec![2; 8]);
        assert_eq!(
            record.body,
            Some(ProtoAnyValue {
                value: Some(ProtoValue::StringValue("hello".to_string()))
            })
        );
    }
}
