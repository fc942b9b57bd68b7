// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

/// Errors raised while loading the forwarder configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Required environment variable {name} is not set: {message}")]
    MissingEnv { name: String, message: String },

    #[error("Invalid exporter '{name}': {message}")]
    InvalidExporter { name: String, message: String },

    #[error("Forward route '{route}' references unknown exporter '{exporter}'")]
    UnknownExporter { route: String, exporter: String },

    #[error("Invalid attribute rule in forward route '{route}': {message}")]
    InvalidRule { route: String, message: String },
}

/// Errors raised by exporters
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Collector responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Invalid header '{name}': {message}")]
    InvalidHeader { name: String, message: String },

    #[error("Exporter '{0}' is not started")]
    NotStarted(String),

    #[error("Exporter '{0}' failed to start: {1}")]
    StartFailed(String, String),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<ExportError>),
}

impl ExportError {
    /// Collapses a list of errors into one, or `None` when the list is empty.
    #[must_use]
    pub fn aggregate(mut errors: Vec<ExportError>) -> Option<ExportError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ExportError::Aggregate(errors)),
        }
    }

    /// Number of leaf errors carried by this error.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            ExportError::Aggregate(errors) => errors.iter().map(ExportError::count).sum(),
            _ => 1,
        }
    }
}

fn join_errors(errors: &[ExportError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ExportError::Status {
            status: 503,
            body: "unavailable".to_string(),
        };
        assert_eq!(error.to_string(), "Collector responded with 503: unavailable");

        let error = ConfigError::UnknownExporter {
            route: "default".to_string(),
            exporter: "jaeger".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Forward route 'default' references unknown exporter 'jaeger'"
        );
    }

    #[test]
    fn test_aggregate_joins_messages() {
        let error = ExportError::aggregate(vec![
            ExportError::NotStarted("a".to_string()),
            ExportError::Encode("bad".to_string()),
        ])
        .expect("two errors");
        assert_eq!(
            error.to_string(),
            "Exporter 'a' is not started; Failed to encode request: bad"
        );
        assert_eq!(error.count(), 2);
    }

    #[test]
    fn test_aggregate_of_one_or_none() {
        assert!(ExportError::aggregate(Vec::new()).is_none());
        let error = ExportError::aggregate(vec![ExportError::NotStarted("a".to_string())])
            .expect("one error");
        assert!(matches!(error, ExportError::NotStarted(_)));
    }
}
