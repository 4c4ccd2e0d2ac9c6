//! Bus configuration.
//!
//! One immutable [`BusConfig`] is built before [`Bus::connect`](crate::Bus::connect)
//! and shared behind an `Arc` afterwards; nothing mutates it at runtime.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Effect |
//! |----------|---------|--------|
//! | `CS_TRANSPORT_URL` / `NATS_URL` | (required) | connection target |
//! | `CS_STREAM_PREFIX` | `CS` | namespaces subjects |
//! | `CS_DURABLE_PREFIX` | `cybersentinel` | consumer identity |
//! | `CS_MAX_ACK_PENDING` | `256` | backpressure bound |
//! | `CS_MAX_DELIVER` | `5` | dead-letter threshold |
//! | `CS_ACK_WAIT_SECONDS` | `30` | redelivery timeout |
//! | `CS_RETRY_BASE_DELAY` | `1.0` | backoff base (seconds) |
//! | `CS_RETRY_MAX_DELAY` | `30.0` | backoff cap (seconds) |
//! | `CS_FETCH_BATCH_SIZE` | `10` | pull batch size |
//! | `CS_FETCH_EXPIRES_MS` | `2000` | longest blocking pull |
//! | `CS_PUBLISH_MAX_ATTEMPTS` | `5` | publish retry budget |
//! | `CS_DLQ_ERROR_MAX_LEN` | `512` | `Error` header truncation |
//! | `CS_DLQ_FAILURE_POLICY` | `withhold` | `withhold` or `ack_and_log` |
//! | `CS_SHUTDOWN_GRACE_SECONDS` | `10` | in-flight handler grace on disconnect |
//! | `CS_TRACING_ENABLED` | `false` | span emission |
//! | `CS_NATS_CREDS` | unset | NATS credentials file |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default stream/subject prefix.
pub const DEFAULT_STREAM_PREFIX: &str = "CS";

/// Default durable consumer name prefix.
pub const DEFAULT_DURABLE_PREFIX: &str = "cybersentinel";

/// Configuration errors. Fatal at `connect()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Transport URL is not set")]
    MissingUrl,

    #[error("Unsupported transport URL {0:?} (expected nats://, tls:// or memory://)")]
    UnsupportedUrl(String),

    #[error("Credentials file not found: {0}")]
    MissingCredentials(String),

    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("retry_base_delay ({base:?}) exceeds retry_max_delay ({max:?})")]
    BackoffRange { base: Duration, max: Duration },
}

/// What to do when the dead-letter write for an exhausted message fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DlqFailurePolicy {
    /// Leave the original unacked so it stays in the stream for manual recovery.
    #[default]
    WithholdAck,
    /// Ack the original anyway and log the lost diagnostic trail.
    AckAndLog,
}

impl FromStr for DlqFailurePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "withhold" | "withhold_ack" => Ok(Self::WithholdAck),
            "ack_and_log" | "ack" => Ok(Self::AckAndLog),
            _ => Err(()),
        }
    }
}

/// Which transport adapter a URL selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Nats,
    Memory,
}

/// Configuration for a [`Bus`](crate::Bus).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Connection target (`nats://host:4222`, `tls://...`, `memory://name`)
    pub transport_url: String,

    /// Stream name and subject namespace
    pub stream_prefix: String,

    /// Prefix for transport-side durable consumer names
    pub durable_prefix: String,

    /// Most un-acked deliveries the transport hands one durable at once
    pub max_ack_pending: u32,

    /// Delivery attempts before a failing message is dead-lettered
    pub max_deliver: u32,

    /// How long the transport waits for an ack before redelivering
    pub ack_wait: Duration,

    /// First redelivery delay
    pub retry_base_delay: Duration,

    /// Redelivery delay cap
    pub retry_max_delay: Duration,

    /// Messages requested per pull
    pub fetch_batch_size: u32,

    /// Longest a single pull blocks waiting for messages
    pub fetch_expires: Duration,

    /// Publish attempts before `PublishFailed`
    pub publish_max_attempts: u32,

    /// Byte bound on the `Error` dead-letter header
    pub dlq_error_max_len: usize,

    pub dlq_failure_policy: DlqFailurePolicy,

    /// Grace period for in-flight handlers on disconnect/unsubscribe
    pub shutdown_grace: Duration,

    /// Emit publish/consume spans
    pub tracing_enabled: bool,

    /// Rolling latency sample size for percentiles
    pub latency_window: usize,

    pub credentials_file: Option<PathBuf>,

    pub connect_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            transport_url: String::new(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            durable_prefix: DEFAULT_DURABLE_PREFIX.to_string(),
            max_ack_pending: 256,
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            fetch_batch_size: 10,
            fetch_expires: Duration::from_secs(2),
            publish_max_attempts: 5,
            dlq_error_max_len: 512,
            dlq_failure_policy: DlqFailurePolicy::WithholdAck,
            shutdown_grace: Duration::from_secs(10),
            tracing_enabled: false,
            latency_window: 2048,
            credentials_file: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    /// Defaults with the given transport URL.
    pub fn new(transport_url: impl Into<String>) -> Self {
        Self {
            transport_url: transport_url.into(),
            ..Self::default()
        }
    }

    /// Read configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        Ok(Self {
            transport_url: lookup("CS_TRANSPORT_URL")
                .or_else(|| lookup("NATS_URL"))
                .unwrap_or_default(),
            stream_prefix: lookup("CS_STREAM_PREFIX").unwrap_or(defaults.stream_prefix),
            durable_prefix: lookup("CS_DURABLE_PREFIX").unwrap_or(defaults.durable_prefix),
            max_ack_pending: parse(&lookup, "CS_MAX_ACK_PENDING")?
                .unwrap_or(defaults.max_ack_pending),
            max_deliver: parse(&lookup, "CS_MAX_DELIVER")?.unwrap_or(defaults.max_deliver),
            ack_wait: seconds(&lookup, "CS_ACK_WAIT_SECONDS")?.unwrap_or(defaults.ack_wait),
            retry_base_delay: seconds(&lookup, "CS_RETRY_BASE_DELAY")?
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: seconds(&lookup, "CS_RETRY_MAX_DELAY")?
                .unwrap_or(defaults.retry_max_delay),
            fetch_batch_size: parse(&lookup, "CS_FETCH_BATCH_SIZE")?
                .unwrap_or(defaults.fetch_batch_size),
            fetch_expires: parse::<u64, _>(&lookup, "CS_FETCH_EXPIRES_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.fetch_expires),
            publish_max_attempts: parse(&lookup, "CS_PUBLISH_MAX_ATTEMPTS")?
                .unwrap_or(defaults.publish_max_attempts),
            dlq_error_max_len: parse(&lookup, "CS_DLQ_ERROR_MAX_LEN")?
                .unwrap_or(defaults.dlq_error_max_len),
            dlq_failure_policy: parse(&lookup, "CS_DLQ_FAILURE_POLICY")?
                .unwrap_or(defaults.dlq_failure_policy),
            shutdown_grace: seconds(&lookup, "CS_SHUTDOWN_GRACE_SECONDS")?
                .unwrap_or(defaults.shutdown_grace),
            tracing_enabled: flag(&lookup, "CS_TRACING_ENABLED")?
                .unwrap_or(defaults.tracing_enabled),
            latency_window: defaults.latency_window,
            credentials_file: lookup("CS_NATS_CREDS").map(PathBuf::from),
            connect_timeout: defaults.connect_timeout,
        })
    }

    /// Check every tunable. Called by `connect()` before touching the transport.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport_kind()?;

        if let Some(path) = &self.credentials_file {
            if !path.exists() {
                return Err(ConfigError::MissingCredentials(path.display().to_string()));
            }
        }

        let nonzero: [(&'static str, u64); 6] = [
            ("max_ack_pending", self.max_ack_pending as u64),
            ("max_deliver", self.max_deliver as u64),
            ("fetch_batch_size", self.fetch_batch_size as u64),
            ("publish_max_attempts", self.publish_max_attempts as u64),
            ("latency_window", self.latency_window as u64),
            ("ack_wait", self.ack_wait.as_millis() as u64),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }

        if self.stream_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CS_STREAM_PREFIX",
                value: String::new(),
            });
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::BackoffRange {
                base: self.retry_base_delay,
                max: self.retry_max_delay,
            });
        }

        Ok(())
    }

    /// Adapter selected by the URL scheme.
    pub fn transport_kind(&self) -> Result<TransportKind, ConfigError> {
        let url = self.transport_url.trim();
        if url.is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        match url.split_once("://") {
            Some(("nats" | "tls", rest)) if !rest.is_empty() => Ok(TransportKind::Nats),
            Some(("memory", _)) => Ok(TransportKind::Memory),
            _ => Err(ConfigError::UnsupportedUrl(url.to_string())),
        }
    }

    /// Name of the main stream.
    pub fn stream_name(&self) -> String {
        self.stream_prefix.clone()
    }

    /// Name of the dead-letter stream.
    pub fn dlq_stream_name(&self) -> String {
        format!("{}_DLQ", self.stream_prefix)
    }

    /// Subject a topic is published on.
    pub fn subject_for(&self, topic: &str) -> String {
        format!("{}.{}", self.stream_prefix, topic)
    }

    /// Dead-letter subject for a message originally published on `subject`.
    pub fn dlq_subject_for(&self, subject: &str) -> String {
        let topic = subject
            .strip_prefix(&self.stream_prefix)
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(subject);
        format!("{}.{}", self.dlq_stream_name(), topic)
    }

    /// Transport-side durable name for a caller-chosen durable.
    pub fn durable_for(&self, durable_name: &str) -> String {
        let raw = format!("{}-{}", self.durable_prefix, durable_name);
        raw.chars()
            .map(|c| match c {
                '.' | '*' | '>' => '_',
                c if c.is_whitespace() => '_',
                c => c,
            })
            .collect()
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

fn seconds<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match parse::<f64, F>(lookup, key)? {
        None => Ok(None),
        Some(secs) if secs.is_finite() && secs >= 0.0 => Ok(Some(Duration::from_secs_f64(secs))),
        Some(secs) => Err(ConfigError::InvalidValue {
            key,
            value: secs.to_string(),
        }),
    }
}

fn flag<F>(lookup: &F, key: &'static str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue { key, value }),
        },
    }
}
