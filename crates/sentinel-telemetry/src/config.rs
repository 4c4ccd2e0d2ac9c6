//! Telemetry configuration from environment variables.

use std::env;

/// Configuration for logging, tracing export and metrics.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name for traces and logs
    pub service_name: String,

    /// OpenTelemetry OTLP collector endpoint
    pub otlp_endpoint: String,

    /// Export spans over OTLP (otherwise logs only)
    pub otlp_enabled: bool,

    /// Log level filter (trace, debug, info, warn, error)
    pub log_level: String,

    /// Whether to enable console output (for development)
    pub console_output: bool,

    /// Whether to enable JSON formatted logs
    pub json_logs: bool,

    /// Deployment environment (dev, staging, prod)
    pub environment: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "cybersentinel-bus".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
            otlp_enabled: false,
            log_level: "info".to_string(),
            console_output: true,
            json_logs: false,
            environment: "dev".to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OTEL_SERVICE_NAME`: Service name (default: cybersentinel-bus)
    /// - `OTEL_EXPORTER_OTLP_ENDPOINT`: Collector endpoint (default: http://localhost:4317)
    /// - `CS_OTLP_ENABLED`: Export spans over OTLP (default: false)
    /// - `CS_LOG_LEVEL` or `RUST_LOG`: Log level (default: info)
    /// - `CS_CONSOLE_OUTPUT`: Enable console output (default: true)
    /// - `CS_JSON_LOGS`: Enable JSON logs (default: false in dev, true in containers)
    /// - `CS_ENVIRONMENT`: Deployment environment (default: dev)
    pub fn from_env() -> Self {
        let is_container =
            env::var("KUBERNETES_SERVICE_HOST").is_ok() || env::var("DOCKER_CONTAINER").is_ok();

        Self {
            service_name: env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "cybersentinel-bus".to_string()),

            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| "http://localhost:4317".to_string()),

            otlp_enabled: env::var("CS_OTLP_ENABLED")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),

            log_level: env::var("CS_LOG_LEVEL")
                .or_else(|_| env::var("RUST_LOG"))
                .unwrap_or_else(|_| "info".to_string()),

            console_output: env::var("CS_CONSOLE_OUTPUT")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),

            json_logs: env::var("CS_JSON_LOGS")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(is_container),

            environment: env::var("CS_ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()),
        }
    }

    /// Configuration for one named bus component (e.g. a detector service).
    pub fn for_component(component: &str) -> Self {
        let mut config = Self::from_env();
        config.service_name = format!("cybersentinel-{}", component);
        config
    }
}
