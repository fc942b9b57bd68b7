// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP over HTTP, with protobuf or JSON bodies and optional gzip.

use super::Exporter;
use crate::config::{ExporterConfig, Protocol, Signal, SignalSettings};
use crate::error::ExportError;
use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use opentelemetry_proto::tonic::{
    collector::{logs::v1::ExportLogsServiceRequest, trace::v1::ExportTraceServiceRequest},
    logs::v1::ResourceLogs,
    trace::v1::ResourceSpans,
};
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use std::io::Write;
use std::sync::OnceLock;
use tracing::debug;

struct Started {
    client: reqwest::Client,
    traces_headers: HeaderMap,
    logs_headers: HeaderMap,
}

pub struct OtlpHttpExporter {
    name: String,
    traces: SignalSettings,
    logs: SignalSettings,
    started: OnceLock<Started>,
}

impl OtlpHttpExporter {
    #[must_use]
    pub fn new(name: &str, config: &ExporterConfig) -> Self {
        OtlpHttpExporter {
            name: name.to_string(),
            traces: config.resolve(Signal::Traces),
            logs: config.resolve(Signal::Logs),
            started: OnceLock::new(),
        }
    }

    fn settings(&self, signal: Signal) -> &SignalSettings {
        match signal {
            Signal::Traces => &self.traces,
            Signal::Logs => &self.logs,
        }
    }

    async fn send(&self, signal: Signal, payload: Vec<u8>) -> Result<(), ExportError> {
        let started = self
            .started
            .get()
            .ok_or_else(|| ExportError::NotStarted(self.name.clone()))?;
        let settings = self.settings(signal);
        let headers = match signal {
            Signal::Traces => &started.traces_headers,
            Signal::Logs => &started.logs_headers,
        };
        let body = if settings.gzip {
            gzip(&payload)?
        } else {
            payload
        };

        let response = started
            .client
            .post(&settings.url)
            .timeout(settings.timeout)
            .headers(headers.clone())
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            debug!(
                "EXPORTER | {} accepted {} payload with status {}",
                self.name,
                signal.as_str(),
                status.as_u16()
            );
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExportError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn content_type(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::HttpProtobuf => "application/x-protobuf",
        Protocol::HttpJson => "application/json",
    }
}

fn encode<T>(protocol: Protocol, request: &T) -> Result<Vec<u8>, ExportError>
where
    T: Message + serde::Serialize,
{
    match protocol {
        Protocol::HttpProtobuf => Ok(request.encode_to_vec()),
        Protocol::HttpJson => {
            serde_json::to_vec(request).map_err(|e| ExportError::Encode(e.to_string()))
        }
    }
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .and_then(|()| encoder.finish())
        .map_err(|e| ExportError::Encode(format!("gzip: {e}")))
}

fn header_map(settings: &SignalSettings) -> Result<HeaderMap, ExportError> {
    let invalid = |name: &str, message: String| ExportError::InvalidHeader {
        name: name.to_string(),
        message,
    };
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type(settings.protocol)),
    );
    if settings.gzip {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&settings.user_agent)
            .map_err(|e| invalid("user-agent", e.to_string()))?,
    );
    for (name, value) in &settings.headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(name, e.to_string()))?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

#[async_trait]
impl Exporter for OtlpHttpExporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ExportError> {
        let started = Started {
            client: reqwest::Client::builder().build()?,
            traces_headers: header_map(&self.traces)?,
            logs_headers: header_map(&self.logs)?,
        };
        if self.started.set(started).is_err() {
            debug!("EXPORTER | {} was already started", self.name);
        }
        debug!(
            "EXPORTER | {} sending traces to {} and logs to {}",
            self.name, self.traces.url, self.logs.url
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), ExportError> {
        debug!("EXPORTER | {} stopped", self.name);
        Ok(())
    }

    async fn upload_traces(&self, batch: &[ResourceSpans]) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = ExportTraceServiceRequest {
            resource_spans: batch.to_vec(),
        };
        let payload = encode(self.traces.protocol, &request)?;
        self.send(Signal::Traces, payload).await
    }

    async fn upload_logs(&self, batch: &[ResourceLogs]) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let request = ExportLogsServiceRequest {
            resource_logs: batch.to_vec(),
        };
        let payload = encode(self.logs.protocol, &request)?;
        self.send(Signal::Logs, payload).await
    }
}
