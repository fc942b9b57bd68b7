// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use otel_forwarder::app::{RunParams, DEFAULT_FLUSH_TIMEOUT};
use otel_forwarder::config::Config;
use otel_forwarder::duration::parse_duration;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Runs a dbt command and forwards the OpenTelemetry records it writes.
///
/// Everything after `--` is the command to run, for example:
/// `dbt-otel-forwarder -- dbt build --select orders`
#[derive(Debug, Parser)]
#[command(name = "dbt-otel-forwarder", version)]
pub struct Cli {
    /// Directory dbt writes its logs to
    #[arg(long, env = "DBT_LOG_PATH", default_value = "logs")]
    pub log_path: PathBuf,

    /// OpenTelemetry JSONL file name, relative to the log path unless absolute
    #[arg(long, env = "DBT_OTEL_FILE_NAME", default_value = "otel.jsonl")]
    pub otel_file: String,

    /// Forwarder configuration file
    #[arg(
        long,
        env = "DBT_OTEL_FORWARDER_CONFIG",
        default_value = "dbt-otel-forwarder-config.yml"
    )]
    pub config: PathBuf,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// `json` or `text`
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    #[arg(long, env = "DBT_OTEL_SERVICE_NAME", default_value = otel_forwarder::DEFAULT_SERVICE_NAME)]
    pub service_name: String,

    /// Upper bound on the final flush after the command exits (e.g. `30s`, `5m`)
    #[arg(long, env = "DBT_OTEL_FLUSH_TIMEOUT", default_value = "5m")]
    pub flush_timeout: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Loads the forwarder configuration and assembles the run parameters.
    /// Configuration problems are logged and the run goes ahead without
    /// forwarding.
    pub fn into_run_params(self) -> RunParams {
        let config = match Config::load(&self.config) {
            Ok(config) => {
                debug!("CONFIG | Loaded {}", self.config.display());
                config
            }
            Err(e) => {
                warn!("CONFIG | {}, telemetry will not be forwarded", e);
                Config::default()
            }
        };
        let flush_timeout = parse_duration(&self.flush_timeout).unwrap_or_else(|e| {
            warn!(
                "CONFIG | Invalid flush timeout: {}, using {:?}",
                e, DEFAULT_FLUSH_TIMEOUT
            );
            DEFAULT_FLUSH_TIMEOUT
        });

        let mut params = RunParams::new(self.command, config);
        params.log_path = self.log_path;
        params.otel_file = self.otel_file;
        params.service_name = self.service_name;
        params.flush_timeout = flush_timeout;
        params
    }
}
