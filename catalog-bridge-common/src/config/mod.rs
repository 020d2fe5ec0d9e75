use clap::Parser;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;

pub const ENV_DEV: &str = "dev";

/// Prefix of every environment variable read by [`Config::load_config`].
pub const ENV_PREFIX: &str = "SYNC_BRIDGE";

/// Hard limits imposed by SQS on a single receive call.
pub const MAX_POLL_BATCH_SIZE: i32 = 10;
pub const MAX_LONG_POLL_WAIT_SECONDS: i32 = 20;
pub const MAX_VISIBILITY_TIMEOUT_SECONDS: i32 = 43_200;

#[derive(Debug, Parser)]
pub struct Opt {
    #[clap(long)]
    requests_queue_url: Option<String>,

    #[clap(long)]
    responses_queue_url: Option<String>,

    #[clap(long)]
    http_port: Option<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS region, `eu-north-1` when unset.
    pub region: Option<String>,

    /// Endpoint override, e.g. a local ElasticMQ or localstack instance.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub host:        String,
    pub port:        u16,
    pub queue_size:  usize,
    pub buffer_size: usize,
    pub prefix:      String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service_name: String,

    #[serde(default)]
    pub traces_endpoint: Option<String>,

    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

/// What the poller does with a reply whose correlation id nobody is waiting for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedMessagePolicy {
    /// Park the payload in the registry as an orphan and delete the message.
    #[default]
    Orphan,
    /// Leave the message for another consumer by releasing its visibility.
    Release,
}

impl fmt::Display for UnresolvedMessagePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedMessagePolicy::Orphan => write!(f, "orphan"),
            UnresolvedMessagePolicy::Release => write!(f, "release"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub environment: String,

    #[serde(default)]
    pub aws: Option<AwsConfig>,

    #[serde(default)]
    pub service: Option<ServiceConfig>,

    /// Destination the producer publishes requests to.
    #[serde(default)]
    pub requests_queue_url: String,

    /// Queue the poller drains replies from.
    #[serde(default)]
    pub responses_queue_url: String,

    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: i32,

    #[serde(default = "default_long_poll_wait_seconds")]
    pub long_poll_wait_seconds: i32,

    #[serde(default = "default_visibility_timeout_seconds")]
    pub visibility_timeout_seconds: i32,

    /// Visibility applied to released messages; zero means immediate redelivery.
    #[serde(default)]
    pub release_visibility_seconds: i32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Age after which a settled or orphaned registry entry is evicted.
    #[serde(default = "default_reaper_grace_period_secs")]
    pub reaper_grace_period_secs: u64,

    #[serde(default = "default_max_receive_attempts")]
    pub max_receive_attempts: usize,

    #[serde(default = "default_receive_backoff_base_ms")]
    pub receive_backoff_base_ms: u64,

    #[serde(default = "default_receive_backoff_max_ms")]
    pub receive_backoff_max_ms: u64,

    #[serde(default)]
    pub unresolved_message_policy: UnresolvedMessagePolicy,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_shutdown_drain_timeout_secs")]
    pub shutdown_drain_timeout_secs: u64,
}

fn default_poll_batch_size() -> i32 {
    10
}

fn default_long_poll_wait_seconds() -> i32 {
    20
}

fn default_visibility_timeout_seconds() -> i32 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_reaper_interval_secs() -> u64 {
    120
}

fn default_reaper_grace_period_secs() -> u64 {
    300
}

fn default_max_receive_attempts() -> usize {
    10
}

fn default_receive_backoff_base_ms() -> u64 {
    200
}

fn default_receive_backoff_max_ms() -> u64 {
    20_000
}

fn default_http_port() -> u16 {
    8080
}

fn default_shutdown_drain_timeout_secs() -> u64 {
    10
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} must be within {min}..={max}, got {value}")]
    OutOfRange {
        name:  &'static str,
        value: i64,
        min:   i64,
        max:   i64,
    },

    #[error("request_timeout_secs must be greater than zero")]
    ZeroRequestTimeout,

    #[error("reaper_interval_secs must be greater than zero")]
    ZeroReaperInterval,

    #[error(
        "reaper_grace_period_secs ({grace}) must exceed request_timeout_secs ({timeout}), otherwise live waiters could be reaped"
    )]
    GracePeriodTooShort { grace: u64, timeout: u64 },
}

impl Config {
    pub fn load_config(prefix: &str) -> Result<Config> {
        let settings = config::Config::builder();
        let settings = settings
            .add_source(
                config::Environment::with_prefix(prefix)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = settings.try_deserialize::<Config>()?;
        Ok(config)
    }

    pub fn overwrite_defaults_with_cli_args(&mut self, opts: Opt) {
        if let Some(requests_queue_url) = opts.requests_queue_url {
            self.requests_queue_url = requests_queue_url;
        }

        if let Some(responses_queue_url) = opts.responses_queue_url {
            self.responses_queue_url = responses_queue_url;
        }

        if let Some(http_port) = opts.http_port {
            self.http_port = http_port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requests_queue_url.trim().is_empty() {
            return Err(ConfigError::Missing("requests_queue_url"));
        }
        if self.responses_queue_url.trim().is_empty() {
            return Err(ConfigError::Missing("responses_queue_url"));
        }
        check_range("poll_batch_size", self.poll_batch_size, 1, MAX_POLL_BATCH_SIZE)?;
        check_range(
            "long_poll_wait_seconds",
            self.long_poll_wait_seconds,
            0,
            MAX_LONG_POLL_WAIT_SECONDS,
        )?;
        check_range(
            "visibility_timeout_seconds",
            self.visibility_timeout_seconds,
            0,
            MAX_VISIBILITY_TIMEOUT_SECONDS,
        )?;
        check_range(
            "release_visibility_seconds",
            self.release_visibility_seconds,
            0,
            MAX_VISIBILITY_TIMEOUT_SECONDS,
        )?;
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::ZeroReaperInterval);
        }
        if self.reaper_grace_period_secs <= self.request_timeout_secs {
            return Err(ConfigError::GracePeriodTooShort {
                grace:   self.reaper_grace_period_secs,
                timeout: self.request_timeout_secs,
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn reaper_grace_period(&self) -> Duration {
        Duration::from_secs(self.reaper_grace_period_secs)
    }

    pub fn receive_backoff_base(&self) -> Duration {
        Duration::from_millis(self.receive_backoff_base_ms)
    }

    pub fn receive_backoff_max(&self) -> Duration {
        Duration::from_millis(self.receive_backoff_max_ms)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment:                 ENV_DEV.to_string(),
            aws:                         None,
            service:                     None,
            requests_queue_url:          String::new(),
            responses_queue_url:         String::new(),
            poll_batch_size:             default_poll_batch_size(),
            long_poll_wait_seconds:      default_long_poll_wait_seconds(),
            visibility_timeout_seconds:  default_visibility_timeout_seconds(),
            release_visibility_seconds:  0,
            request_timeout_secs:        default_request_timeout_secs(),
            reaper_interval_secs:        default_reaper_interval_secs(),
            reaper_grace_period_secs:    default_reaper_grace_period_secs(),
            max_receive_attempts:        default_max_receive_attempts(),
            receive_backoff_base_ms:     default_receive_backoff_base_ms(),
            receive_backoff_max_ms:      default_receive_backoff_max_ms(),
            unresolved_message_policy:   UnresolvedMessagePolicy::default(),
            http_port:                   default_http_port(),
            shutdown_drain_timeout_secs: default_shutdown_drain_timeout_secs(),
        }
    }
}

fn check_range(name: &'static str, value: i32, min: i32, max: i32) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value: value.into(),
            min:   min.into(),
            max:   max.into(),
        })
    }
}
