//! Tracer configuration.
//!
//! Everything can be set through environment variables (see
//! [`TracerConfig::from_env`]) and overridden with the builder methods.

use std::env;

/// The header that carries the trace root to downstream services.
pub const DEFAULT_PROPAGATION_HEADER: &str = "X-Amzn-Trace-Id";

const DEFAULT_SERVICE_NAME: &str = "faas-function";

/// The options recognized by the tracer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracerConfig {
    /// OTLP collector endpoint. Uses the exporter default when unset.
    pub endpoint: Option<String>,
    /// Sent as the `authorization` metadata on every export.
    pub token: Option<String>,
    /// Lowers the default log level to DEBUG.
    pub verbose: bool,
    /// Disables tracing regardless of the kill-switch variable.
    pub switch_off: bool,
    pub propagation_header: String,
    /// Runs each invocation inside a span carrying the request id, so every
    /// log line emitted by the handler is tagged with it.
    pub request_id_logging: bool,
    /// Whether we are running inside the serverless runtime.
    pub aws_environment: bool,
    pub service_name: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            verbose: false,
            switch_off: false,
            propagation_header: DEFAULT_PROPAGATION_HEADER.to_owned(),
            request_id_logging: false,
            aws_environment: false,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
        }
    }
}

impl TracerConfig {
    /// Reads the configuration from the environment:
    ///
    ///   * `FAAS_TRACING_ENDPOINT`, `FAAS_TRACING_TOKEN`
    ///   * `FAAS_TRACING_VERBOSE`, `FAAS_TRACING_REQUEST_ID_LOGGING` (`true` enables)
    ///   * `FAAS_TRACING_PROPAGATION_HEADER`
    ///   * `LAMBDA_RUNTIME_DIR` (its presence marks the serverless runtime)
    ///   * `AWS_LAMBDA_FUNCTION_NAME` (service name)
    ///
    /// The kill switch is deliberately not read here; it is checked afresh on
    /// every invocation.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            endpoint: non_empty_var("FAAS_TRACING_ENDPOINT"),
            token: non_empty_var("FAAS_TRACING_TOKEN"),
            verbose: flag_var("FAAS_TRACING_VERBOSE"),
            switch_off: false,
            propagation_header: non_empty_var("FAAS_TRACING_PROPAGATION_HEADER")
                .unwrap_or(defaults.propagation_header),
            request_id_logging: flag_var("FAAS_TRACING_REQUEST_ID_LOGGING"),
            aws_environment: env::var_os("LAMBDA_RUNTIME_DIR").is_some(),
            service_name: non_empty_var("AWS_LAMBDA_FUNCTION_NAME")
                .unwrap_or(defaults.service_name),
        }
    }

    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..self
        }
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..self
        }
    }

    pub fn with_verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }

    pub fn with_switch_off(self, switch_off: bool) -> Self {
        Self { switch_off, ..self }
    }

    pub fn with_propagation_header(self, header: impl Into<String>) -> Self {
        Self {
            propagation_header: header.into(),
            ..self
        }
    }

    pub fn with_request_id_logging(self, request_id_logging: bool) -> Self {
        Self {
            request_id_logging,
            ..self
        }
    }

    pub fn with_aws_environment(self, aws_environment: bool) -> Self {
        Self {
            aws_environment,
            ..self
        }
    }

    pub fn with_service_name(self, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..self
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn flag_var(key: &str) -> bool {
    env::var(key).is_ok_and(|value| value.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = TracerConfig::default()
            .with_endpoint("http://collector:4317")
            .with_switch_off(true)
            .with_propagation_header("traceparent");

        assert_eq!(config.endpoint.as_deref(), Some("http://collector:4317"));
        assert!(config.switch_off);
        assert_eq!(config.propagation_header, "traceparent");
        assert_eq!(config.service_name, DEFAULT_SERVICE_NAME);
    }
}
