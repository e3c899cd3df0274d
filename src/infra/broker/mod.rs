//! Message broker access
//!
//! The broker is reached through three small traits mirroring an AMQP
//! client: a client that opens connections, connections that open
//! channels, and channels that declare exchanges and publish. Each
//! connection and channel exposes a one-shot failure signal.
//!
//! [`ResilientBroker`] owns one connection and channel on top of these
//! traits and reconnects when either fails. [`MemoryBroker`] is an
//! in-process implementation with fault injection; `AmqpClient` (feature
//! `amqp`) talks to RabbitMQ through `lapin`.

#[cfg(feature = "amqp")]
mod amqp;
mod memory;
mod resilient;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metrics::{metric_names, MetricsRegistry};

use super::Result;

#[cfg(feature = "amqp")]
pub use amqp::AmqpClient;
pub use memory::{Delivery, MemoryBroker};
pub use resilient::{ConnectionState, ResilientBroker};

/// Message headers carried alongside a payload
pub type MessageHeaders = BTreeMap<String, String>;

/// Resolves once, with a reason, when a connection or channel fails
pub type FailureSignal = Pin<Box<dyn Future<Output = String> + Send>>;

/// Exchange routing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Every bound queue receives every message
    Fanout,
    Direct,
    Topic,
}

/// Opens broker connections
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// One-shot signal for connection errors
    fn failure_signal(&self) -> FailureSignal;

    async fn close(&self) -> Result<()>;
}

/// A publishing channel on a connection
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare `name`, creating it if absent
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()>;

    async fn publish(&self, exchange: &str, payload: &[u8], headers: &MessageHeaders)
        -> Result<()>;

    /// One-shot signal for the channel closing
    fn close_signal(&self) -> FailureSignal;
}

/// Broker connection settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Connection URL
    pub url: String,
    /// Fan-out exchange deltas are published to
    pub exchange: String,
    /// Maximum reconnect attempts before giving up
    pub retries: u32,
    /// Wait between reconnect attempts
    pub retry_wait: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://127.0.0.1:5672/%2f".to_string(),
            exchange: "quote.deltas".to_string(),
            retries: 10,
            retry_wait: Duration::from_secs(1),
        }
    }
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// The connection or channel failed
    ConnectionWarning { reason: String },
    /// A reconnect attempt is about to start
    ReconnectStarted { attempt: u32, max_attempts: u32 },
    /// The connection was re-established
    Reconnected { attempts: u32 },
    /// Every reconnect attempt failed; `error` is the last attempt's failure
    ReconnectFailed { attempts: u32, error: String },
}

/// Record broker events into metrics until the event channel closes.
pub fn spawn_event_recorder(
    mut events: broadcast::Receiver<BrokerEvent>,
    metrics: Arc<MetricsRegistry>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "broker event recorder lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let name = match event {
                BrokerEvent::ConnectionWarning { .. } => metric_names::BROKER_WARNINGS,
                BrokerEvent::ReconnectStarted { .. } => metric_names::BROKER_RECONNECT_ATTEMPTS,
                BrokerEvent::Reconnected { .. } => metric_names::BROKER_RECONNECTS,
                BrokerEvent::ReconnectFailed { .. } => metric_names::BROKER_RECONNECT_FAILURES,
            };
            metrics.inc_counter(name).await;
        }
        info!("broker event recorder stopped");
    })
}
