//! AMQP 0.9.1 broker client backed by `lapin`
//!
//! Channels run in publisher-confirm mode: a publish succeeds only once the
//! broker acks it.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::oneshot;

use super::{
    BrokerChannel, BrokerClient, BrokerConnection, ExchangeKind, FailureSignal, MessageHeaders,
};
use crate::infra::{headers, RelayError, Result};

/// Content type when the headers carry none
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

fn broker_error(context: &str, err: lapin::Error) -> RelayError {
    RelayError::Broker(format!("{context}: {err}"))
}

/// Signal fed by a lapin error callback
fn error_signal<F>(register: F) -> FailureSignal
where
    F: FnOnce(Box<dyn FnMut(lapin::Error) + Send>),
{
    let (tx, rx) = oneshot::channel();
    let mut tx = Some(tx);
    register(Box::new(move |err| {
        if let Some(tx) = tx.take() {
            let _ = tx.send(err.to_string());
        }
    }));
    Box::pin(async move { rx.await.unwrap_or_else(|_| "handler dropped".to_string()) })
}

/// Opens AMQP connections
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpClient;

impl AmqpClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerClient for AmqpClient {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerConnection>> {
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from("quote-relay".to_string()));
        let connection = Connection::connect(url, properties)
            .await
            .map_err(|e| broker_error("connect", e))?;
        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| broker_error("create channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| broker_error("enable publisher confirms", e))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn failure_signal(&self) -> FailureSignal {
        error_signal(|handler| self.connection.on_error(handler))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(200, "closing")
            .await
            .map_err(|e| broker_error("close", e))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

fn field_table(message_headers: &MessageHeaders) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in message_headers {
        table.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn properties(message_headers: &MessageHeaders) -> BasicProperties {
    let content_type = message_headers
        .get(headers::CONTENT_TYPE)
        .map_or(DEFAULT_CONTENT_TYPE, String::as_str);
    BasicProperties::default()
        .with_content_type(ShortString::from(content_type.to_string()))
        .with_delivery_mode(2)
        .with_headers(field_table(message_headers))
}

/// Only a broker ack counts as delivered
fn confirmed(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(RelayError::Broker("publish rejected by broker".into())),
        Confirmation::NotRequested => Err(RelayError::Broker(
            "publish not confirmed: channel is not in confirm mode".into(),
        )),
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, durable: bool) -> Result<()> {
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(|e| broker_error("declare exchange", e))
    }

    async fn publish(
        &self,
        exchange: &str,
        payload: &[u8],
        headers: &MessageHeaders,
    ) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                payload,
                properties(headers),
            )
            .await
            .map_err(|e| broker_error("publish", e))?
            .await
            .map_err(|e| broker_error("publish confirm", e))?;
        confirmed(confirmation)
    }

    fn close_signal(&self) -> FailureSignal {
        error_signal(|handler| self.channel.on_error(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_kind_mapping() {
        assert!(matches!(
            exchange_kind(ExchangeKind::Fanout),
            lapin::ExchangeKind::Fanout
        ));
    }

    #[test]
    fn test_only_ack_confirms_publish() {
        assert!(confirmed(Confirmation::Ack(None)).is_ok());
        assert!(matches!(
            confirmed(Confirmation::Nack(None)),
            Err(RelayError::Broker(_))
        ));
        assert!(matches!(
            confirmed(Confirmation::NotRequested),
            Err(RelayError::Broker(_))
        ));
    }

    #[test]
    fn test_content_type_comes_from_headers() {
        let json = MessageHeaders::from([(
            headers::CONTENT_TYPE.to_string(),
            "application/json".to_string(),
        )]);
        assert_eq!(
            properties(&json).content_type().as_ref().map(|t| t.as_str()),
            Some("application/json")
        );

        let bare = MessageHeaders::new();
        assert_eq!(
            properties(&bare).content_type().as_ref().map(|t| t.as_str()),
            Some(DEFAULT_CONTENT_TYPE)
        );
    }

    #[test]
    fn test_headers_become_long_strings() {
        let headers = MessageHeaders::from([("event".to_string(), "STEP_SAVE".to_string())]);
        let table = field_table(&headers);
        let value = table.inner().get(&ShortString::from("event".to_string()));
        assert!(matches!(value, Some(AMQPValue::LongString(_))));
    }
}
