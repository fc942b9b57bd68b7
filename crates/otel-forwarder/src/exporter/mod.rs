// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Upload clients for telemetry backends.
//!
//! Every configured exporter is wrapped in a [`OnceStart`] guard so that
//! forwarders sharing it can all call `start` safely. A forwarder that sends
//! one signal to several exporters goes through a [`Multiplexer`].

mod multiplex;
mod once;
mod otlp_http;

pub use multiplex::Multiplexer;
pub use once::OnceStart;
pub use otlp_http::OtlpHttpExporter;

use crate::config::ExporterConfig;
use crate::error::ExportError;
use async_trait::async_trait;
use opentelemetry_proto::tonic::{logs::v1::ResourceLogs, trace::v1::ResourceSpans};
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait Exporter: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), ExportError>;

    async fn stop(&self) -> Result<(), ExportError>;

    async fn upload_traces(&self, batch: &[ResourceSpans]) -> Result<(), ExportError>;

    async fn upload_logs(&self, batch: &[ResourceLogs]) -> Result<(), ExportError>;
}

/// Named exporters, shared between forwarders.
pub type ExporterSet = BTreeMap<String, Arc<dyn Exporter>>;

/// Builds one guarded exporter per configured entry. Configuration is
/// expected to be validated already.
#[must_use]
pub fn build_exporters(configs: &BTreeMap<String, ExporterConfig>) -> ExporterSet {
    configs
        .iter()
        .map(|(name, config)| {
            let exporter: Arc<dyn Exporter> =
                Arc::new(OnceStart::new(OtlpHttpExporter::new(name, config)));
            (name.clone(), exporter)
        })
        .collect()
}
