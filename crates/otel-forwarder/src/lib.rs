// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # OTel Forwarder
//!
//! Runs a dbt command and, while it runs, follows the OpenTelemetry JSONL file
//! it writes. Span start/end records are paired back into spans, log records
//! are correlated to their span, attributes are rewritten through configured
//! rules and the result is uploaded to one or more OTLP endpoints.
//!
//! ## Architecture
//!
//! ```text
//!   tailer ──> line queue ──> flush loop ──> decoder ──> forwarders ──> exporters
//!                                                          │
//!                                                     modifiers (CEL)
//! ```
//!
//! - [`tailer`]: waits for the log file and streams appended lines
//! - [`decoder`]: rebuilds spans and logs from raw records
//! - [`modifier`] and [`expr`]: conditional attribute rules
//! - [`forwarder`]: one named route (resource, rules, exporters)
//! - [`exporter`]: OTLP upload clients and the fan-out multiplexer
//! - [`app`]: run lifecycle around the wrapped command
//!
//! The wrapped command's exit code and stdio are never affected by anything
//! that happens in the telemetry pipeline.

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

pub mod app;
pub mod config;
pub mod decoder;
pub mod duration;
pub mod error;
pub mod exporter;
pub mod expr;
pub mod forwarder;
pub mod model;
pub mod modifier;
pub mod otlp;
pub mod tailer;

/// Name reported as the instrumentation scope and in the default user agent.
pub const APP_NAME: &str = "dbt-otel-forwarder";

/// Version reported as the instrumentation scope version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name used when the resource attributes do not define one.
pub const DEFAULT_SERVICE_NAME: &str = "dbt";
