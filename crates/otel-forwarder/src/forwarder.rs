// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named output routes.
//!
//! A forwarder owns the resource attributes of its route, the compiled
//! attribute rules for each signal and the exporter (or multiplexer) each
//! signal is sent to. Records are cloned before rules run, so routes never
//! see each other's rewrites.

use crate::config::{Config, ForwardConfig, SignalForwardConfig};
use crate::error::ExportError;
use crate::exporter::{build_exporters, Exporter, ExporterSet, Multiplexer};
use crate::expr::{Activation, Schema, LOG_SCHEMA, SPAN_SCHEMA};
use crate::model::{AnyValue, KeyValue, LogEntry, Span};
use crate::modifier::{compile_rules, log_activation, span_activation, AttributeModifier};
use crate::otlp;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const SERVICE_NAME_KEY: &str = "service.name";

pub struct Forwarder {
    name: String,
    resource: Vec<KeyValue>,
    span_modifiers: Vec<AttributeModifier>,
    log_modifiers: Vec<AttributeModifier>,
    traces: Option<Arc<dyn Exporter>>,
    logs: Option<Arc<dyn Exporter>>,
}

impl Forwarder {
    /// Builds a route. Unknown exporter names and rules that fail to compile
    /// are logged and left out.
    #[must_use]
    pub fn new(
        name: &str,
        config: &ForwardConfig,
        exporters: &ExporterSet,
        service_name: &str,
    ) -> Self {
        Forwarder {
            name: name.to_string(),
            resource: resource_attributes(config, service_name),
            span_modifiers: compile_signal_rules(name, &config.traces, &SPAN_SCHEMA),
            log_modifiers: compile_signal_rules(name, &config.logs, &LOG_SCHEMA),
            traces: select_exporter(name, "traces", &config.traces, exporters),
            logs: select_exporter(name, "logs", &config.logs, exporters),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn resource(&self) -> &[KeyValue] {
        &self.resource
    }

    fn exporters(&self) -> Vec<&Arc<dyn Exporter>> {
        let mut exporters: Vec<&Arc<dyn Exporter>> = Vec::with_capacity(2);
        for exporter in [&self.traces, &self.logs].into_iter().flatten() {
            if !exporters.iter().any(|e| Arc::ptr_eq(*e, exporter)) {
                exporters.push(exporter);
            }
        }
        exporters
    }

    pub async fn start(&self) -> Result<(), ExportError> {
        let mut errors = Vec::new();
        for exporter in self.exporters() {
            if let Err(e) = exporter.start().await {
                errors.push(e);
            }
        }
        ExportError::aggregate(errors).map_or(Ok(()), Err)
    }

    pub async fn stop(&self) -> Result<(), ExportError> {
        let mut errors = Vec::new();
        for exporter in self.exporters() {
            if let Err(e) = exporter.stop().await {
                errors.push(e);
            }
        }
        ExportError::aggregate(errors).map_or(Ok(()), Err)
    }

    /// Applies the span rules to a copy of `spans` and uploads them as one
    /// resource envelope. A route without a traces exporter does nothing.
    pub async fn upload_traces(&self, spans: &[Span]) -> Result<(), ExportError> {
        let Some(exporter) = &self.traces else {
            return Ok(());
        };
        if spans.is_empty() {
            return Ok(());
        }
        let mut spans = spans.to_vec();
        for span in &mut spans {
            let activation = span_activation(span);
            self.apply(&self.span_modifiers, &activation, &mut span.attributes);
        }
        exporter
            .upload_traces(&[otlp::resource_spans(&self.resource, &spans)])
            .await
    }

    /// Applies the log rules to a copy of `logs` and uploads them as one
    /// resource envelope. A route without a logs exporter does nothing.
    pub async fn upload_logs(&self, logs: &[LogEntry]) -> Result<(), ExportError> {
        let Some(exporter) = &self.logs else {
            return Ok(());
        };
        if logs.is_empty() {
            return Ok(());
        }
        let mut logs = logs.to_vec();
        for log in &mut logs {
            let activation = log_activation(log);
            self.apply(&self.log_modifiers, &activation, &mut log.attributes);
        }
        exporter
            .upload_logs(&[otlp::resource_logs(&self.resource, &logs)])
            .await
    }

    fn apply(
        &self,
        modifiers: &[AttributeModifier],
        activation: &Activation,
        attributes: &mut Vec<KeyValue>,
    ) {
        for modifier in modifiers {
            if let Err(e) = modifier.apply(activation, attributes) {
                warn!("FORWARDER | {}: skipping rule: {}", self.name, e);
            }
        }
    }
}

fn resource_attributes(config: &ForwardConfig, service_name: &str) -> Vec<KeyValue> {
    let mut resource: Vec<KeyValue> = config
        .resource
        .attributes
        .iter()
        .filter_map(|(key, value)| AnyValue::from_json(value).map(|v| KeyValue::new(key, v)))
        .collect();
    if !resource.iter().any(|kv| kv.key == SERVICE_NAME_KEY) {
        resource.insert(0, KeyValue::new(SERVICE_NAME_KEY, service_name));
    }
    resource
}

fn compile_signal_rules(
    route: &str,
    config: &SignalForwardConfig,
    schema: &Schema,
) -> Vec<AttributeModifier> {
    let (modifiers, errors) = compile_rules(&config.attributes, schema);
    for e in errors {
        warn!(
            "FORWARDER | {}: ignoring {} attribute rule: {}",
            route, schema.name, e
        );
    }
    modifiers
}

fn select_exporter(
    route: &str,
    signal: &str,
    config: &SignalForwardConfig,
    exporters: &ExporterSet,
) -> Option<Arc<dyn Exporter>> {
    let mut selected: Vec<Arc<dyn Exporter>> = Vec::with_capacity(config.exporters.len());
    for name in &config.exporters {
        match exporters.get(name) {
            Some(exporter) => selected.push(Arc::clone(exporter)),
            None => warn!(
                "FORWARDER | {}: unknown {} exporter '{}', skipping",
                route, signal, name
            ),
        }
    }
    match selected.len() {
        0 => None,
        1 => selected.pop(),
        _ => Some(Arc::new(Multiplexer::new(selected))),
    }
}

/// Builds and starts one forwarder per route, in route name order. Routes
/// whose exporters fail to start are left out.
pub async fn build_forwarders(config: &Config, service_name: &str) -> Vec<Forwarder> {
    if config.exporters.is_empty() {
        warn!("FORWARDER | No exporters configured, telemetry will not be forwarded");
        return Vec::new();
    }
    let exporters = build_exporters(&config.exporters);
    let mut forwarders = Vec::with_capacity(config.forward.len());
    for (name, route) in &config.forward {
        let forwarder = Forwarder::new(name, route, &exporters, service_name);
        match forwarder.start().await {
            Ok(()) => {
                debug!("FORWARDER | {} started", name);
                forwarders.push(forwarder);
            }
            Err(e) => error!("FORWARDER | Failed to start {}: {}", name, e),
        }
    }
    forwarders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttributeRule, ExporterConfig};
    use crate::exporter::testing::RecordingExporter;
    use crate::model::find_attribute;
    use opentelemetry_proto::tonic::common::v1::{
        any_value::Value as ProtoValue, KeyValue as ProtoKeyValue,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use tracing_test::traced_test;

    fn route(value: serde_json::Value) -> ForwardConfig {
        serde_json::from_value(value).expect("valid route")
    }

    fn exporter_set(exporters: &[&Arc<RecordingExporter>]) -> ExporterSet {
        exporters
            .iter()
            .map(|e| (e.name.clone(), Arc::clone(*e) as Arc<dyn Exporter>))
            .collect()
    }

    fn span(name: &str) -> Span {
        Span {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            name: name.to_string(),
            attributes: vec![
                KeyValue::new("dbt.materialized", "table"),
                KeyValue::new("db.statement", "select 1"),
            ],
            ..Span::default()
        }
    }

    fn string_attr<'a>(attributes: &'a [ProtoKeyValue], key: &str) -> Option<&'a str> {
        attributes
            .iter()
            .find(|kv| kv.key == key)
            .and_then(|kv| kv.value.as_ref())
            .and_then(|v| match &v.value {
                Some(ProtoValue::StringValue(s)) => Some(s.as_str()),
                _ => None,
            })
    }

    #[tokio::test]
    async fn test_rules_applied_before_upload() {
        let collector = Arc::new(RecordingExporter::new("collector"));
        let forwarder = Forwarder::new(
            "default",
            &route(json!({
                "traces": {
                    "attributes": [
                        {"key": "db.statement", "action": "remove"},
                        {"key": "renamed", "value_expr": "\"prefix_\" + name"}
                    ],
                    "exporters": ["collector"]
                }
            })),
            &exporter_set(&[&collector]),
            "dbt",
        );
        forwarder.start().await.unwrap();
        let spans = vec![span("test-span")];
        forwarder.upload_traces(&spans).await.unwrap();

        let uploaded = collector.spans.lock().unwrap();
        assert_eq!(uploaded.len(), 1);
        let resource = uploaded[0].resource.as_ref().unwrap();
        assert_eq!(string_attr(&resource.attributes, "service.name"), Some("dbt"));
        let sent = &uploaded[0].scope_spans[0].spans[0];
        assert_eq!(string_attr(&sent.attributes, "renamed"), Some("prefix_test-span"));
        assert_eq!(string_attr(&sent.attributes, "db.statement"), None);
        assert_eq!(string_attr(&sent.attributes, "dbt.materialized"), Some("table"));

        // caller's records are untouched
        assert!(find_attribute(&spans[0].attributes, "db.statement").is_some());
    }

    #[tokio::test]
    async fn test_routes_do_not_share_rewrites() {
        let first = Arc::new(RecordingExporter::new("first"));
        let second = Arc::new(RecordingExporter::new("second"));
        let exporters = exporter_set(&[&first, &second]);
        let scrub = Forwarder::new(
            "scrub",
            &route(json!({"traces": {
                "attributes": [{"key": "db.statement", "action": "remove"}],
                "exporters": ["first"]
            }})),
            &exporters,
            "dbt",
        );
        let raw = Forwarder::new(
            "raw",
            &route(json!({"traces": {"exporters": ["second"]}})),
            &exporters,
            "dbt",
        );
        let spans = vec![span("orders")];
        for forwarder in [&scrub, &raw] {
            forwarder.start().await.unwrap();
            forwarder.upload_traces(&spans).await.unwrap();
        }

        let scrubbed = first.spans.lock().unwrap();
        let attributes = &scrubbed[0].scope_spans[0].spans[0].attributes;
        assert_eq!(string_attr(attributes, "db.statement"), None);
        let untouched = second.spans.lock().unwrap();
        let attributes = &untouched[0].scope_spans[0].spans[0].attributes;
        assert_eq!(string_attr(attributes, "db.statement"), Some("select 1"));
    }

    #[tokio::test]
    async fn test_multiple_exporters_isolated() {
        let healthy = Arc::new(RecordingExporter::new("healthy"));
        let broken = Arc::new(RecordingExporter::failing("broken"));
        let forwarder = Forwarder::new(
            "default",
            &route(json!({"logs": {"exporters": ["broken", "healthy"]}})),
            &exporter_set(&[&healthy, &broken]),
            "dbt",
        );
        let logs = vec![LogEntry {
            trace_id: vec![1; 16],
            span_id: vec![2; 8],
            ..LogEntry::default()
        }];
        let err = forwarder.upload_logs(&logs).await.unwrap_err();
        assert_eq!(err.count(), 1);
        assert_eq!(healthy.logs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_signal_without_exporter_is_noop() {
        let collector = Arc::new(RecordingExporter::new("collector"));
        let forwarder = Forwarder::new(
            "default",
            &route(json!({"traces": {"exporters": ["collector"]}})),
            &exporter_set(&[&collector]),
            "dbt",
        );
        forwarder.upload_logs(&[LogEntry::default()]).await.unwrap();
        assert!(collector.logs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_resource_attributes() {
        let config = route(json!({"resource": {"attributes": {
            "deployment.environment": "prod",
            "team.size": 4,
            "ignored": null
        }}}));
        let resource = resource_attributes(&config, "jaffle");
        assert_eq!(
            resource,
            vec![
                KeyValue::new("service.name", "jaffle"),
                KeyValue::new("deployment.environment", "prod"),
                KeyValue::new("team.size", 4_i64),
            ]
        );

        let config = route(json!({"resource": {"attributes": {"service.name": "custom"}}}));
        assert_eq!(
            resource_attributes(&config, "jaffle"),
            vec![KeyValue::new("service.name", "custom")]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_exporter_and_bad_rule_are_skipped() {
        let collector = Arc::new(RecordingExporter::new("collector"));
        let forwarder = Forwarder::new(
            "default",
            &ForwardConfig {
                traces: SignalForwardConfig {
                    attributes: vec![AttributeRule {
                        key: "x".to_string(),
                        value_expr: Some("severityText".to_string()),
                        ..AttributeRule::default()
                    }],
                    exporters: vec!["missing".to_string(), "collector".to_string()],
                },
                ..ForwardConfig::default()
            },
            &exporter_set(&[&collector]),
            "dbt",
        );
        assert!(forwarder.span_modifiers.is_empty());
        assert!(forwarder.traces.is_some());
        assert!(logs_contain("unknown traces exporter 'missing'"));
        assert!(logs_contain("ignoring span attribute rule"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_build_forwarders_without_exporters() {
        let forwarders = build_forwarders(&Config::default(), "dbt").await;
        assert!(forwarders.is_empty());
        assert!(logs_contain("No exporters configured"));
    }

    #[tokio::test]
    async fn test_build_forwarders_in_name_order() {
        let exporter = ExporterConfig {
            exporter_type: "otlp".to_string(),
            endpoint: "http://localhost:4318".to_string(),
            ..ExporterConfig::default()
        };
        let config = Config {
            exporters: BTreeMap::from([("collector".to_string(), exporter)]),
            forward: BTreeMap::from([
                ("zeta".to_string(), route(json!({"traces": {"exporters": ["collector"]}}))),
                ("alpha".to_string(), route(json!({"logs": {"exporters": ["collector"]}}))),
            ]),
        };
        let forwarders = build_forwarders(&config, "dbt").await;
        let names: Vec<&str> = forwarders.iter().map(Forwarder::name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
