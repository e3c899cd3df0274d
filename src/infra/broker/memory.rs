//! In-process broker
//!
//! Fan-out exchanges backed by tokio broadcast channels, plus fault
//! injection: refuse the next N connects, sever every open connection, or
//! close every open channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::debug;

use super::{
    BrokerChannel, BrokerClient, BrokerConnection, ExchangeKind, FailureSignal, MessageHeaders,
};
use crate::infra::{RelayError, Result};

const SUBSCRIBER_CAPACITY: usize = 1024;

/// A message delivered to an exchange subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

struct Exchange {
    declared: Option<(ExchangeKind, bool)>,
    tx: broadcast::Sender<Delivery>,
}

impl Exchange {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self { declared: None, tx }
    }
}

/// Failure state shared by a connection or channel and the broker
struct Link {
    failed: watch::Sender<Option<String>>,
}

impl Link {
    fn new() -> Arc<Self> {
        let (failed, _) = watch::channel(None);
        Arc::new(Self { failed })
    }

    fn fail(&self, reason: &str) {
        self.failed.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    fn is_failed(&self) -> bool {
        self.failed.borrow().is_some()
    }

    fn signal(&self) -> FailureSignal {
        let mut rx = self.failed.subscribe();
        Box::pin(async move {
            loop {
                if let Some(reason) = rx.borrow_and_update().clone() {
                    return reason;
                }
                if rx.changed().await.is_err() {
                    return "link dropped".to_string();
                }
            }
        })
    }
}

#[derive(Default)]
struct Shared {
    exchanges: Mutex<HashMap<String, Exchange>>,
    connections: Mutex<Vec<Arc<Link>>>,
    channels: Mutex<Vec<Arc<Link>>>,
    refuse_connects: AtomicU32,
    connect_attempts: AtomicU32,
}

/// In-process broker with fan-out delivery
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: u32) {
        self.shared.refuse_connects.store(count, Ordering::SeqCst);
    }

    /// Connection attempts made so far, refused ones included
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Bind a new subscriber to `exchange`
    pub async fn subscribe(&self, exchange: &str) -> broadcast::Receiver<Delivery> {
        let mut exchanges = self.shared.exchanges.lock().await;
        exchanges
            .entry(exchange.to_string())
            .or_insert_with(Exchange::new)
            .tx
            .subscribe()
    }

    /// Kind and durability an exchange was declared with
    pub async fn exchange(&self, name: &str) -> Option<(ExchangeKind, bool)> {
        let exchanges = self.shared.exchanges.lock().await;
        exchanges.get(name).and_then(|e| e.declared)
    }

    /// Fail every open connection and its channels
    pub async fn sever(&self, reason: &str) {
        for link in self.shared.connections.lock().await.drain(..) {
            link.fail(reason);
        }
        for link in self.shared.channels.lock().await.drain(..) {
            link.fail(reason);
        }
        debug!(reason, "memory broker severed connections");
    }

    /// Close every open channel, leaving connections up
    pub async fn close_channels(&self, reason: &str) {
        for link in self.shared.channels.lock().await.drain(..) {
            link.fail(reason);
        }
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RelayError::Broker(format!("connection refused: {url}")));
        }

        let link = Link::new();
        self.shared.connections.lock().await.push(link.clone());
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            link,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    link: Arc<Link>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.link.is_failed() {
            return Err(RelayError::Broker("connection is closed".into()));
        }

        let link = Link::new();
        self.shared.channels.lock().await.push(link.clone());
        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            connection: self.link.clone(),
            link,
        }))
    }

    fn failure_signal(&self) -> FailureSignal {
        self.link.signal()
    }

    async fn close(&self) -> Result<()> {
        self.link.fail("closed");
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    connection: Arc<Link>,
    link: Arc<Link>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.link.is_failed() || self.connection.is_failed() {
            return Err(RelayError::Broker("channel is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        self.ensure_open()?;

        let mut exchanges = self.shared.exchanges.lock().await;
        let exchange = exchanges.entry(name.to_string()).or_insert_with(Exchange::new);
        match exchange.declared {
            Some(existing) if existing != (kind, durable) => Err(RelayError::Broker(format!(
                "exchange {name} already declared as {existing:?}"
            ))),
            _ => {
                exchange.declared = Some((kind, durable));
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<()> {
        self.ensure_open()?;

        let exchanges = self.shared.exchanges.lock().await;
        let target = exchanges
            .get(exchange)
            .filter(|e| e.declared.is_some())
            .ok_or_else(|| RelayError::Broker(format!("no exchange {exchange}")))?;

        // Messages to an exchange with no bound subscribers are dropped
        let _ = target.tx.send(Delivery {
            exchange: exchange.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });
        Ok(())
    }

    fn close_signal(&self) -> FailureSignal {
        self.link.signal()
    }
}
