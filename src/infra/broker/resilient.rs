//! Self-healing broker connection
//!
//! Holds one connection and one publishing channel to a durable fan-out
//! exchange. A single watcher task per connection waits on the
//! connection's failure signal and the channel's close signal; when either
//! fires, the link is dropped and a bounded reconnect runs. The watcher of
//! a replaced connection is aborted before the new one is installed, and a
//! generation counter makes a late signal from an old link a no-op.
//!
//! Exhausting the reconnect attempts is fatal: the error is returned to
//! every caller waiting on the reconnect and published on the fatal channel.
//! At most one reconnect loop runs at a time; later callers wait for its
//! outcome instead of starting their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{
    BrokerChannel, BrokerClient, BrokerConfig, BrokerConnection, BrokerEvent, ExchangeKind,
    MessageHeaders,
};
use crate::infra::retry::{Retry, RetryConfig, Sleeper, TokioSleeper};
use crate::infra::{RelayError, Result};
use crate::telemetry::spans;

const EVENT_CAPACITY: usize = 64;

/// Broker connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

struct Link {
    state: ConnectionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    channel: Option<Arc<dyn BrokerChannel>>,
    watcher: Option<JoinHandle<()>>,
    generation: u64,
}

impl Link {
    /// Drop the channel and stop watching, handing back the connection
    fn detach(&mut self) -> Option<Arc<dyn BrokerConnection>> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.channel = None;
        self.connection.take()
    }
}

/// Outcome of the most recent reconnect loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastReconnect {
    None,
    Succeeded,
    Exhausted { attempts: u32 },
}

struct Inner {
    client: Arc<dyn BrokerClient>,
    config: BrokerConfig,
    sleeper: Arc<dyn Sleeper>,
    link: Mutex<Link>,
    reconnect_gate: Mutex<LastReconnect>,
    closed: AtomicBool,
    events: broadcast::Sender<BrokerEvent>,
    fatal: watch::Sender<Option<String>>,
}

/// Broker connection that reconnects on failure
#[derive(Clone)]
pub struct ResilientBroker {
    inner: Arc<Inner>,
}

impl ResilientBroker {
    pub fn new(client: Arc<dyn BrokerClient>, config: BrokerConfig) -> Self {
        Self::with_sleeper(client, config, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        client: Arc<dyn BrokerClient>,
        config: BrokerConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (fatal, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                client,
                config,
                sleeper,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    connection: None,
                    channel: None,
                    watcher: None,
                    generation: 0,
                }),
                reconnect_gate: Mutex::new(LastReconnect::None),
                closed: AtomicBool::new(false),
                events,
                fatal,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// Subscribe to connection lifecycle events
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    /// Receiver that holds the fatal error once reconnecting has given up
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.inner.fatal.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.link.lock().await.state
    }

    /// Open the connection and channel and declare the exchange.
    pub async fn connect(&self) -> Result<()> {
        let span = info_span!(spans::BROKER_CONNECT, exchange = %self.inner.config.exchange);
        async {
            self.inner.ensure_open()?;
            self.inner.set_state(ConnectionState::Connecting).await;

            match self.inner.open().await {
                Ok((connection, channel)) => {
                    self.inner.install(connection, channel).await;
                    info!("broker connected");
                    Ok(())
                }
                Err(e) => {
                    self.inner.set_state(ConnectionState::Disconnected).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Reconnect now, retrying up to the configured ceiling.
    ///
    /// Returns [`RelayError::ReconnectExhausted`] when every attempt fails.
    /// If a reconnect is already running this waits for it and returns its
    /// outcome.
    pub async fn reconnect(&self) -> Result<()> {
        let span = info_span!(spans::BROKER_RECONNECT, exchange = %self.inner.config.exchange);
        self.inner.reconnect().instrument(span).await
    }

    /// Current channel, if connected.
    ///
    /// Without a channel this starts a background reconnect (unless one is
    /// already running) and returns `None`.
    pub async fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        let channel = self.inner.link.lock().await.channel.clone();
        if channel.is_none() && !self.inner.closed.load(Ordering::SeqCst) {
            self.inner.spawn_reconnect();
        }
        channel
    }

    /// Publish to the configured exchange.
    ///
    /// Fails with [`RelayError::BrokerUnavailable`] while disconnected.
    pub async fn publish(&self, payload: &[u8], headers: &MessageHeaders) -> Result<()> {
        let channel = self.channel().await.ok_or(RelayError::BrokerUnavailable)?;
        channel
            .publish(&self.inner.config.exchange, payload, headers)
            .await
    }

    /// Close the connection. Calling this again is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let connection = {
            let mut link = self.inner.link.lock().await;
            link.state = ConnectionState::Closed;
            link.detach()
        };

        if let Some(connection) = connection {
            connection.close().await?;
            info!("broker connection closed");
        }
        Ok(())
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Broker("broker connection is closed".into()));
        }
        Ok(())
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut link = self.link.lock().await;
        if link.state != ConnectionState::Closed {
            link.state = state;
        }
    }

    fn emit(&self, event: BrokerEvent) {
        match &event {
            BrokerEvent::ConnectionWarning { reason } => {
                warn!(reason = %reason, "broker connection lost")
            }
            BrokerEvent::ReconnectStarted {
                attempt,
                max_attempts,
            } => info!(attempt, max_attempts, "reconnecting to broker"),
            BrokerEvent::Reconnected { attempts } => info!(attempts, "broker reconnected"),
            BrokerEvent::ReconnectFailed { attempts, error } => {
                error!(attempts, error = %error, "giving up on broker reconnect")
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn open(&self) -> Result<(Arc<dyn BrokerConnection>, Arc<dyn BrokerChannel>)> {
        let connection = self.client.connect(&self.config.url).await?;
        let channel = connection.create_channel().await?;
        channel
            .assert_exchange(&self.config.exchange, ExchangeKind::Fanout, true)
            .await?;
        Ok((connection, channel))
    }

    async fn install(
        self: &Arc<Self>,
        connection: Arc<dyn BrokerConnection>,
        channel: Arc<dyn BrokerChannel>,
    ) {
        let mut link = self.link.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            drop(link);
            if let Err(e) = connection.close().await {
                debug!(error = %e, "closing connection opened after close");
            }
            return;
        }

        let replaced = link.detach();
        link.generation += 1;
        let generation = link.generation;
        let connection_failed = connection.failure_signal();
        let channel_closed = channel.close_signal();
        let weak = Arc::downgrade(self);

        link.watcher = Some(tokio::spawn(async move {
            let reason = tokio::select! {
                reason = connection_failed => format!("connection error: {reason}"),
                reason = channel_closed => format!("channel closed: {reason}"),
            };
            Inner::on_failure(weak, generation, reason).await;
        }));
        link.connection = Some(connection);
        link.channel = Some(channel);
        link.state = ConnectionState::Connected;
        drop(link);

        if let Some(old) = replaced {
            if let Err(e) = old.close().await {
                debug!(error = %e, "closing replaced connection");
            }
        }
    }

    async fn on_failure(weak: Weak<Self>, generation: u64, reason: String) {
        let Some(inner) = weak.upgrade() else {
            return;
        };

        {
            let mut link = inner.link.lock().await;
            if link.generation != generation || link.state == ConnectionState::Closed {
                return;
            }
            // This task is the watcher being cleared; dropping its handle detaches it
            link.watcher = None;
            link.connection = None;
            link.channel = None;
            link.state = ConnectionState::Connecting;
        }

        inner.emit(BrokerEvent::ConnectionWarning { reason });
        inner.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnect_gate.try_lock().is_err() {
            return;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            // Exhaustion is reported through the fatal channel
            let _ = inner.reconnect().await;
        });
    }

    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.ensure_open()?;
        let mut last = match self.reconnect_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                debug!("reconnect already in progress, waiting for it");
                let last = *self.reconnect_gate.lock().await;
                self.ensure_open()?;
                return match last {
                    LastReconnect::Succeeded => Ok(()),
                    LastReconnect::Exhausted { attempts } => {
                        Err(RelayError::ReconnectExhausted { attempts })
                    }
                    LastReconnect::None => Err(RelayError::BrokerUnavailable),
                };
            }
        };

        let result = self.reconnect_with_retry().await;
        *last = match &result {
            Ok(()) => LastReconnect::Succeeded,
            Err(RelayError::ReconnectExhausted { attempts }) => LastReconnect::Exhausted {
                attempts: *attempts,
            },
            Err(_) => LastReconnect::None,
        };
        result
    }

    async fn reconnect_with_retry(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;

        let max_attempts = self.config.retries;
        let retry = Retry::new(
            RetryConfig::fixed(max_attempts, self.config.retry_wait),
            self.sleeper.as_ref(),
        );

        let inner: &Inner = self;
        let outcome = retry
            .run(
                move || inner.open(),
                move |_| !inner.closed.load(Ordering::SeqCst),
                move |attempt| {
                    inner.emit(BrokerEvent::ReconnectStarted {
                        attempt,
                        max_attempts,
                    })
                },
            )
            .await;

        match outcome.result {
            Ok((connection, channel)) => {
                self.install(connection, channel).await;
                self.emit(BrokerEvent::Reconnected {
                    attempts: outcome.attempts,
                });
                Ok(())
            }
            Err(e) if self.closed.load(Ordering::SeqCst) => Err(e),
            Err(e) => {
                let stale = {
                    let mut link = self.link.lock().await;
                    link.state = ConnectionState::Disconnected;
                    link.detach()
                };
                if let Some(connection) = stale {
                    let _ = connection.close().await;
                }
                self.emit(BrokerEvent::ReconnectFailed {
                    attempts: outcome.attempts,
                    error: e.to_string(),
                });

                let exhausted = RelayError::ReconnectExhausted {
                    attempts: outcome.attempts,
                };
                self.fatal.send_replace(Some(exhausted.to_string()));
                Err(exhausted)
            }
        }
    }
}
