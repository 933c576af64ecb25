//! AMQP implementation of the transport seam, backed by `lapin`.
//!
//! The only module that touches the broker client. Everything above works
//! against the `herald-core` transport traits, so the client's types and
//! error shapes never leak past this file.

use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use herald_core::transport::{
    ConnectionEvent, ConnectionEventCallback, Delivery, DeliveryStream, ExchangeSpec,
    MessageProperties, Transport, TransportChannel, TransportConnection, TransportError,
};
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, ConnectionProperties, ExchangeKind};

use crate::config::BrokerConfig;

/// AMQP reply code for a normal, error-free close.
const REPLY_SUCCESS: u16 = 200;

/// [`Transport`] over a real AMQP broker.
pub struct AmqpTransport {
    uri: String,
}

impl AmqpTransport {
    /// Create a transport for the configured broker.
    #[must_use]
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
        }
    }
}

impl Transport for AmqpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn TransportConnection>, TransportError>> {
        Box::pin(async move {
            let connection = lapin::Connection::connect(&self.uri, ConnectionProperties::default())
                .await
                .map_err(|err| classify_connect_error(&err))?;
            Ok(Arc::new(AmqpConnection { inner: connection }) as Arc<dyn TransportConnection>)
        })
    }
}

/// Connect failures worth retrying are the network-shaped ones; protocol
/// failures (bad credentials, bad vhost) are not.
fn classify_connect_error(err: &lapin::Error) -> TransportError {
    match err {
        lapin::Error::IOError(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(io.to_string())
        }
        lapin::Error::IOError(io) => TransportError::Unreachable(io.to_string()),
        other => TransportError::Channel(other.to_string()),
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
}

impl TransportConnection for AmqpConnection {
    fn create_channel(&self) -> BoxFuture<'_, Result<Box<dyn TransportChannel>, TransportError>> {
        Box::pin(async move {
            let channel = self
                .inner
                .create_channel()
                .await
                .map_err(|err| TransportError::Channel(err.to_string()))?;
            Ok(Box::new(AmqpChannel { inner: channel }) as Box<dyn TransportChannel>)
        })
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn on_event(&self, callback: ConnectionEventCallback) {
        self.inner.on_error(move |err| {
            callback(&ConnectionEvent::Shutdown {
                reason: err.to_string(),
            });
        });
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
}

impl TransportChannel for AmqpChannel {
    fn declare_exchange(&self, spec: &ExchangeSpec) -> BoxFuture<'_, Result<(), TransportError>> {
        let spec = spec.clone();
        Box::pin(async move {
            self.inner
                .exchange_declare(
                    spec.name.as_str(),
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: spec.durable,
                        auto_delete: spec.auto_delete,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|err| TransportError::Channel(err.to_string()))
        })
    }

    fn declare_queue(&self, name: &str) -> BoxFuture<'_, Result<(), TransportError>> {
        let name = name.to_string();
        Box::pin(async move {
            self.inner
                .queue_declare(
                    name.as_str(),
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map(|_| ())
                .map_err(|err| TransportError::Channel(err.to_string()))
        })
    }

    fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let queue = queue.to_string();
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            self.inner
                .queue_bind(
                    queue.as_str(),
                    exchange.as_str(),
                    routing_key.as_str(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| TransportError::Channel(err.to_string()))
        })
    }

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BoxFuture<'_, Result<(), TransportError>> {
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        Box::pin(async move {
            let confirm = self
                .inner
                .basic_publish(
                    exchange.as_str(),
                    routing_key.as_str(),
                    BasicPublishOptions::default(),
                    &body,
                    basic_properties(&properties),
                )
                .await
                .map_err(|err| TransportError::Publish(err.to_string()))?;
            confirm
                .await
                .map_err(|err| TransportError::Publish(err.to_string()))?;
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BoxFuture<'_, Result<DeliveryStream, TransportError>> {
        let queue = queue.to_string();
        let consumer_tag = consumer_tag.to_string();
        Box::pin(async move {
            let consumer = self
                .inner
                .basic_consume(
                    queue.as_str(),
                    consumer_tag.as_str(),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|err| TransportError::Consume(err.to_string()))?;

            let stream = consumer.map(|item| match item {
                Ok(delivery) => Ok(Delivery {
                    body: delivery.data,
                    acker: Box::new(AmqpAcker {
                        inner: delivery.acker,
                    }),
                }),
                Err(err) => Err(TransportError::Consume(err.to_string())),
            });
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner
                .close(REPLY_SUCCESS, "channel released")
                .await
                .map_err(|err| TransportError::Channel(err.to_string()))
        })
    }
}

/// Translate transport-level properties into AMQP basic properties.
fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in &properties.headers {
        headers.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.as_str().into()),
        );
    }

    let mut props = BasicProperties::default()
        .with_message_id(properties.message_id.as_str().into())
        .with_correlation_id(properties.correlation_id.as_str().into())
        .with_timestamp(properties.timestamp_epoch_secs)
        .with_type(properties.event_type.as_str().into())
        .with_content_type(properties.content_type.as_str().into())
        .with_headers(headers);
    if properties.persistent {
        props = props.with_delivery_mode(2);
    }
    props
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

impl herald_core::transport::Acker for AmqpAcker {
    fn ack(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner
                .ack(BasicAckOptions::default())
                .await
                .map_err(|err| TransportError::Consume(err.to_string()))
        })
    }

    fn requeue(self: Box<Self>) -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner
                .nack(BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                })
                .await
                .map_err(|err| TransportError::Consume(err.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn refused_and_unreachable_are_transient_for_connect() {
        let refused = lapin::Error::IOError(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert!(matches!(
            classify_connect_error(&refused),
            TransportError::Refused(_)
        ));

        let timed_out = lapin::Error::IOError(Arc::new(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out",
        )));
        assert!(matches!(
            classify_connect_error(&timed_out),
            TransportError::Unreachable(_)
        ));
    }

    #[test]
    fn protocol_errors_are_not_retried_as_connects() {
        let protocol = lapin::Error::InvalidChannelState(lapin::ChannelState::Closed);
        let classified = classify_connect_error(&protocol);
        assert!(matches!(classified, TransportError::Channel(_)));
        assert!(!classified.is_transient_connect());
    }

    #[test]
    fn properties_translate_to_amqp_basic_properties() {
        let properties = MessageProperties {
            message_id: "11111111-2222-3333-4444-555555555555".to_string(),
            correlation_id: "corr-9".to_string(),
            timestamp_epoch_secs: 1_700_000_000,
            event_type: "booking.created".to_string(),
            content_type: "application/json".to_string(),
            persistent: true,
            headers: vec![("X-Source-Service".to_string(), "booking-service".to_string())],
        };

        let props = basic_properties(&properties);
        assert_eq!(
            props.message_id().as_ref().map(|id| id.as_str()),
            Some("11111111-2222-3333-4444-555555555555")
        );
        assert_eq!(props.timestamp(), &Some(1_700_000_000));
        assert_eq!(
            props.kind().as_ref().map(|kind| kind.as_str()),
            Some("booking.created")
        );
        assert_eq!(props.delivery_mode(), &Some(2));
        let has_source_header = props.headers().as_ref().is_some_and(|table| {
            table
                .inner()
                .keys()
                .any(|key| key.as_str() == "X-Source-Service")
        });
        assert!(has_source_header);
    }
}
