// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use tracing::{debug, warn, Subscriber};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

const NOISY_DEPENDENCIES: &str = "h2=off,hyper=off,hyper_util=off,reqwest=off,rustls=off";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

fn env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::new(format!(
        "{NOISY_DEPENDENCIES},{}",
        level.to_string().to_lowercase()
    ))
}

/// Installs the global subscriber. Logs go to stderr so that the wrapped
/// command owns stdout. Invalid settings fall back to `info` and `json`.
pub fn init(level: &str, format: &str) {
    let parsed_level = LevelFilter::from_str(level.trim());
    let parsed_format = LogFormat::from_str(format);

    let builder = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(
            parsed_level.as_ref().copied().unwrap_or(LevelFilter::INFO),
        ))
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);
    let subscriber: Box<dyn Subscriber + Send + Sync> =
        match parsed_format.as_ref().copied().unwrap_or(LogFormat::Json) {
            LogFormat::Json => Box::new(builder.json().finish()),
            LogFormat::Text => Box::new(builder.with_ansi(false).finish()),
        };

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if parsed_level.is_err() {
        warn!("Invalid log level '{}', using info", level);
    }
    if let Err(e) = parsed_format {
        warn!("{}, using json", e);
    }
    debug!("Logging subsystem enabled");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("TEXT".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
