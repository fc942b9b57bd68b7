// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwarder configuration file.
//!
//! The file names exporters and forward routes. Environment variables are
//! expanded before the YAML is parsed:
//!
//! - `${VAR}` expands to the value of `VAR`, or to an empty string
//! - `${VAR:-default}` expands to `default` when `VAR` is unset or empty
//! - `${VAR:?message}` fails loading with `message` when `VAR` is unset or empty
//!
//! # Example Configuration
//!
//! ```yaml
//! exporters:
//!   collector:
//!     type: otlp
//!     endpoint: ${OTEL_ENDPOINT:-http://localhost:4318}
//!     gzip: true
//!     headers:
//!       x-api-key: ${API_KEY:?API_KEY is required}
//!
//! forward:
//!   default:
//!     resource:
//!       attributes:
//!         deployment.environment: prod
//!     traces:
//!       attributes:
//!         - key: db.statement
//!           action: remove
//!         - key: dbt.failed
//!           value: true
//!           when: status.code == "ERROR"
//!       exporters: [collector]
//!     logs:
//!       exporters: [collector]
//! ```

use crate::duration::deserialize_optional_duration;
use crate::error::ConfigError;
use figment::{
    providers::{Format, Yaml},
    Figment,
};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);
pub const OTLP_EXPORTER_TYPE: &str = "otlp";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub exporters: BTreeMap<String, ExporterConfig>,
    pub forward: BTreeMap<String, ForwardConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "http/protobuf")]
    HttpProtobuf,
    #[serde(rename = "http/json")]
    HttpJson,
}

/// Telemetry signal an exporter endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Traces,
    Logs,
}

impl Signal {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Logs => "logs",
        }
    }

    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Logs => "/v1/logs",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SignalOverrides {
    pub endpoint: Option<String>,
    pub protocol: Option<Protocol>,
    pub gzip: Option<bool>,
    pub headers: BTreeMap<String, String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub export_timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    #[serde(rename = "type")]
    pub exporter_type: String,
    pub endpoint: String,
    pub protocol: Option<Protocol>,
    pub gzip: Option<bool>,
    pub headers: BTreeMap<String, String>,
    #[serde(deserialize_with = "deserialize_optional_duration")]
    pub export_timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub traces: Option<SignalOverrides>,
    pub logs: Option<SignalOverrides>,
}

/// Exporter settings for one signal, with per-signal overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSettings {
    pub url: String,
    pub protocol: Protocol,
    pub gzip: bool,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub user_agent: String,
}

impl ExporterConfig {
    /// Resolves the settings used to upload `signal`. A per-signal endpoint is
    /// used as is; otherwise the signal path is appended to the base endpoint.
    #[must_use]
    pub fn resolve(&self, signal: Signal) -> SignalSettings {
        let overrides = match signal {
            Signal::Traces => self.traces.as_ref(),
            Signal::Logs => self.logs.as_ref(),
        };
        let url = match overrides
            .and_then(|o| o.endpoint.as_deref())
            .filter(|e| !e.is_empty())
        {
            Some(endpoint) => endpoint.to_string(),
            None => format!("{}{}", self.endpoint.trim_end_matches('/'), signal.path()),
        };
        let mut headers = self.headers.clone();
        if let Some(overrides) = overrides {
            headers.extend(overrides.headers.clone());
        }
        let user_agent = overrides
            .and_then(|o| o.user_agent.as_deref())
            .or(self.user_agent.as_deref())
            .map_or_else(
                || format!("{}/{}", crate::APP_NAME, crate::VERSION),
                ToString::to_string,
            );

        SignalSettings {
            url,
            protocol: overrides
                .and_then(|o| o.protocol)
                .or(self.protocol)
                .unwrap_or_default(),
            gzip: overrides.and_then(|o| o.gzip).or(self.gzip).unwrap_or(false),
            headers,
            timeout: overrides
                .and_then(|o| o.export_timeout)
                .or(self.export_timeout)
                .unwrap_or(DEFAULT_EXPORT_TIMEOUT),
            user_agent,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidExporter {
            name: name.to_string(),
            message,
        };
        if self.exporter_type != OTLP_EXPORTER_TYPE {
            return Err(invalid(format!(
                "unsupported type '{}', expected '{OTLP_EXPORTER_TYPE}'",
                self.exporter_type
            )));
        }
        if self.endpoint.trim().is_empty() {
            return Err(invalid("endpoint is required".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    pub resource: ResourceConfig,
    pub traces: SignalForwardConfig,
    pub logs: SignalForwardConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SignalForwardConfig {
    pub attributes: Vec<AttributeRule>,
    pub exporters: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Set,
    Remove,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AttributeRule {
    #[serde(default)]
    pub action: RuleAction,
    #[serde(default)]
    pub when: Option<String>,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub value_expr: Option<String>,
}

impl AttributeRule {
    pub fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("key is required".to_string());
        }
        if self.action == RuleAction::Set {
            match (&self.value, &self.value_expr) {
                (None, None) => return Err("either value or value_expr must be set".to_string()),
                (Some(_), Some(_)) => {
                    return Err("value and value_expr are mutually exclusive".to_string())
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Config {
    /// Reads, expands and validates the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Config::from_yaml(&raw, |name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML after expanding `${...}` references through `lookup`.
    pub fn from_yaml<F>(raw: &str, lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let expanded = expand_env(raw, lookup)?;
        Figment::from(Yaml::string(&expanded))
            .extract::<Config>()
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, exporter) in &self.exporters {
            exporter.validate(name)?;
        }
        for (route, forward) in &self.forward {
            for signal in [&forward.traces, &forward.logs] {
                if let Some(exporter) = signal
                    .exporters
                    .iter()
                    .find(|name| !self.exporters.contains_key(*name))
                {
                    return Err(ConfigError::UnknownExporter {
                        route: route.clone(),
                        exporter: exporter.clone(),
                    });
                }
                for rule in &signal.attributes {
                    rule.validate().map_err(|message| ConfigError::InvalidRule {
                        route: route.clone(),
                        message: format!("{}: {message}", rule.key),
                    })?;
                }
            }
        }
        Ok(())
    }
}

fn env_reference() -> Result<&'static Regex, ConfigError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\$\{([^}]+)\}"))
        .as_ref()
        .map_err(|e| ConfigError::Parse(format!("invalid variable pattern: {e}")))
}

/// Expands `${VAR}`, `${VAR:-default}` and `${VAR:?message}` references.
pub fn expand_env<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = None;
    let expanded = env_reference()?.replace_all(input, |caps: &Captures| {
        let reference = &caps[1];
        let value_of = |name: &str| lookup(name).filter(|v| !v.is_empty());

        if let Some((name, message)) = reference.split_once(":?") {
            return value_of(name).unwrap_or_else(|| {
                missing.get_or_insert_with(|| ConfigError::MissingEnv {
                    name: name.to_string(),
                    message: message.to_string(),
                });
                String::new()
            });
        }
        if let Some((name, default)) = reference.split_once(":-") {
            return value_of(name).unwrap_or_else(|| default.to_string());
        }
        lookup(reference).unwrap_or_default()
    });
    match missing {
        Some(err) => Err(err),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_reference_pattern_compiles() {
        let pattern = env_reference().expect("pattern compiles");
        assert!(pattern.is_match("${OTEL_ENDPOINT:-http://localhost:4318}"));
        assert!(!pattern.is_match("$OTEL_ENDPOINT"));
    }

    #[test]
    fn test_expand_env_forms() {
        let vars = lookup(&[("HOST", "collector"), ("EMPTY", "")]);
        assert_eq!(
            expand_env("http://${HOST}:${PORT:-4318}", &vars).unwrap(),
            "http://collector:4318"
        );
        assert_eq!(expand_env("${EMPTY:-fallback}", &vars).unwrap(), "fallback");
        assert_eq!(expand_env("[${UNSET}]", &vars).unwrap(), "[]");
        assert_eq!(expand_env("${HOST:?needed}", &vars).unwrap(), "collector");
        assert_eq!(expand_env("no references", &vars).unwrap(), "no references");
    }

    #[test]
    fn test_expand_env_required_missing() {
        let err = expand_env("key: ${API_KEY:?API_KEY must be set}", lookup(&[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Required environment variable API_KEY is not set: API_KEY must be set"
        );
    }

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
exporters:
  collector:
    type: otlp
    endpoint: http://localhost:4318/
    gzip: true
    export_timeout: 2s
    headers:
      x-api-key: secret
    logs:
      endpoint: http://logs.example.com/ingest
      protocol: http/json
      headers:
        x-tenant: acme
forward:
  default:
    resource:
      attributes:
        deployment.environment: prod
    traces:
      attributes:
        - key: db.statement
          action: remove
        - key: dbt.failed
          value: true
          when: status.code == "ERROR"
      exporters: [collector]
    logs:
      exporters: [collector]
"#;
        let config = Config::from_yaml(raw, lookup(&[])).unwrap();
        config.validate().unwrap();

        let exporter = &config.exporters["collector"];
        let traces = exporter.resolve(Signal::Traces);
        assert_eq!(traces.url, "http://localhost:4318/v1/traces");
        assert_eq!(traces.protocol, Protocol::HttpProtobuf);
        assert!(traces.gzip);
        assert_eq!(traces.timeout, Duration::from_secs(2));
        assert_eq!(
            traces.user_agent,
            format!("dbt-otel-forwarder/{}", crate::VERSION)
        );

        let logs = exporter.resolve(Signal::Logs);
        assert_eq!(logs.url, "http://logs.example.com/ingest");
        assert_eq!(logs.protocol, Protocol::HttpJson);
        assert_eq!(logs.headers.len(), 2);

        let route = &config.forward["default"];
        assert_eq!(route.traces.attributes.len(), 2);
        assert_eq!(route.traces.attributes[0].action, RuleAction::Remove);
        assert_eq!(route.traces.attributes[1].action, RuleAction::Set);
        assert_eq!(
            route.traces.attributes[1].when.as_deref(),
            Some(r#"status.code == "ERROR""#)
        );
        assert_eq!(
            route.resource.attributes["deployment.environment"],
            serde_json::json!("prod")
        );
    }

    #[test]
    fn test_validate_rejects_unknown_exporter_reference() {
        let raw = r"
exporters:
  collector:
    type: otlp
    endpoint: http://localhost:4318
forward:
  default:
    traces:
      exporters: [missing]
";
        let err = Config::from_yaml(raw, lookup(&[]))
            .unwrap()
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownExporter { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_exporters() {
        let unsupported = Config::from_yaml(
            "exporters:\n  zipkin:\n    type: zipkin\n    endpoint: http://x\n",
            lookup(&[]),
        )
        .unwrap();
        assert!(matches!(
            unsupported.validate(),
            Err(ConfigError::InvalidExporter { .. })
        ));

        let no_endpoint =
            Config::from_yaml("exporters:\n  otlp:\n    type: otlp\n", lookup(&[])).unwrap();
        assert!(matches!(
            no_endpoint.validate(),
            Err(ConfigError::InvalidExporter { .. })
        ));
    }

    #[test]
    fn test_rule_validation() {
        let rule = |value: serde_json::Value| -> AttributeRule {
            serde_json::from_value(value).unwrap()
        };
        assert!(rule(serde_json::json!({"key": "a", "value": 1})).validate().is_ok());
        assert!(rule(serde_json::json!({"key": "a", "action": "remove"}))
            .validate()
            .is_ok());
        assert_eq!(
            rule(serde_json::json!({"key": "a"})).validate(),
            Err("either value or value_expr must be set".to_string())
        );
        assert!(rule(serde_json::json!({"key": "a", "value": 1, "value_expr": "name"}))
            .validate()
            .is_err());
        assert_eq!(
            rule(serde_json::json!({"value": 1})).validate(),
            Err("key is required".to_string())
        );
    }

    #[test]
    #[serial]
    fn test_load_expands_environment() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("OTEL_ENDPOINT", "http://collector:4318");
            jail.create_file(
                "dbt-otel-forwarder-config.yml",
                r"
exporters:
  collector:
    type: otlp
    endpoint: ${OTEL_ENDPOINT}
    user_agent: ${USER_AGENT:-custom-agent}
",
            )?;
            let config = Config::load(Path::new("dbt-otel-forwarder-config.yml"))
                .expect("config loads");
            let exporter = &config.exporters["collector"];
            assert_eq!(exporter.endpoint, "http://collector:4318");
            assert_eq!(exporter.user_agent.as_deref(), Some("custom-agent"));
            Ok(())
        });
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/forwarder.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
