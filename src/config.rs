//! Relay configuration
//!
//! Read from environment variables. Unset values fall back to defaults;
//! values that are set but malformed are configuration errors, and so are
//! zero reconnect attempts or a zero publish batch.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::infra::broker::BrokerConfig;
use crate::infra::encoder::ProgramInfo;
use crate::infra::{PublisherConfig, RelayError, Result};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Broker connection URL.
    pub amqp_url: String,
    /// Fan-out exchange events are published to.
    pub amqp_exchange: String,
    /// Reconnect attempts before giving up.
    pub amqp_retries: u32,
    /// Wait between reconnect attempts.
    pub amqp_retry_wait: Duration,
    /// Wait between publisher polls.
    pub poll_interval: Duration,
    /// Documents fetched per poll.
    pub batch_size: usize,
    /// Event schema file; the bundled schema when unset.
    pub event_schema_path: Option<PathBuf>,
    /// Program identity stamped on every event.
    pub program: ProgramInfo,
}

impl Default for Config {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        let publisher = PublisherConfig::default();
        Self {
            database_url: "postgres://localhost/quote_relay".to_string(),
            max_connections: 10,
            amqp_url: broker.url,
            amqp_exchange: broker.exchange,
            amqp_retries: broker.retries,
            amqp_retry_wait: broker.retry_wait,
            poll_interval: publisher.poll_interval,
            batch_size: publisher.batch_size,
            event_schema_path: None,
            program: ProgramInfo::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let program = ProgramInfo::new(
            lookup("PROGRAM_ID").unwrap_or(defaults.program.id),
            lookup("PROGRAM_VERSION").unwrap_or(defaults.program.version),
        );

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse(&lookup, "MAX_DB_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            amqp_url: lookup("AMQP_URL").unwrap_or(defaults.amqp_url),
            amqp_exchange: lookup("AMQP_EXCHANGE").unwrap_or(defaults.amqp_exchange),
            amqp_retries: parse(&lookup, "AMQP_RETRIES")?.unwrap_or(defaults.amqp_retries),
            amqp_retry_wait: parse(&lookup, "AMQP_RETRY_WAIT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.amqp_retry_wait),
            poll_interval: parse(&lookup, "PUBLISH_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            batch_size: parse(&lookup, "PUBLISH_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            event_schema_path: lookup("EVENT_SCHEMA_PATH").map(PathBuf::from),
            program,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the broker or the publisher.
    pub fn validate(&self) -> Result<()> {
        if self.amqp_retries == 0 {
            return Err(RelayError::Configuration(
                "AMQP_RETRIES must be at least 1".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(RelayError::Configuration(
                "PUBLISH_BATCH_SIZE must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            url: self.amqp_url.clone(),
            exchange: self.amqp_exchange.clone(),
            retries: self.amqp_retries,
            retry_wait: self.amqp_retry_wait,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            poll_interval: self.poll_interval,
            batch_size: self.batch_size,
        }
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| RelayError::Configuration(format!("invalid {key} {raw:?}: {e}")))
        })
        .transpose()
}
