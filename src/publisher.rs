// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes envelopes according to a binding descriptor. Each
//! publish declares the topology its route needs, propagates the caller's
//! OpenTelemetry context in the message headers and runs on a channel of its
//! own that is closed once the call returns.

use crate::{
    binding::{BindingDescriptor, Route},
    codec::{JsonCodec, PayloadCodec},
    connection::ConnectionProvider,
    envelope::Envelope,
    errors::AmqpError,
    headers::{build_match_headers, ensure_no_reserved},
    otel,
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Sends envelopes to the broker.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `envelope` on the route described by `binding`.
    ///
    /// Fails without contacting the broker when the binding is incomplete or
    /// the envelope headers carry the reserved `x-match` key.
    async fn publish(
        &self,
        ctx: &Context,
        envelope: &Envelope,
        binding: &BindingDescriptor,
    ) -> Result<(), AmqpError>;
}

/// Publisher on top of the shared broker connection.
pub struct RabbitMQPublisher<C = JsonCodec> {
    provider: Arc<ConnectionProvider>,
    codec: C,
}

impl RabbitMQPublisher<JsonCodec> {
    pub fn new(provider: Arc<ConnectionProvider>) -> Arc<RabbitMQPublisher<JsonCodec>> {
        RabbitMQPublisher::with_codec(provider, JsonCodec)
    }
}

impl<C: PayloadCodec> RabbitMQPublisher<C> {
    pub fn with_codec(provider: Arc<ConnectionProvider>, codec: C) -> Arc<RabbitMQPublisher<C>> {
        Arc::new(RabbitMQPublisher { provider, codec })
    }

    /// Encodes `value` with the publisher codec and publishes it.
    ///
    /// An encoding failure is returned before any broker interaction.
    pub async fn publish_value<T>(
        &self,
        ctx: &Context,
        value: &T,
        binding: &BindingDescriptor,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let envelope = Envelope::encode(&self.codec, value)?;
        self.publish(ctx, &envelope, binding).await
    }

    /// The envelope as it goes out: trace context injected, headers-route
    /// criteria merged in, the binding TTL as default expiration and the
    /// codec content type when the envelope names none.
    fn outgoing(
        &self,
        ctx: &Context,
        envelope: &Envelope,
        binding: &BindingDescriptor,
    ) -> Envelope {
        let mut outgoing = envelope.clone();

        if let Route::Headers(spec) = binding.route() {
            let mut merged = outgoing.headers.clone();
            merged.extend(spec.headers().clone());
            outgoing.headers = build_match_headers(&merged, spec.mode());
        }

        otel::inject(ctx, &mut outgoing.headers);

        if outgoing.ttl_millis.is_none() {
            outgoing.ttl_millis = Some(binding.ttl_millis());
        }

        if outgoing.content_type.is_none() {
            outgoing.content_type = Some(self.codec.content_type().to_owned());
        }

        outgoing
    }
}

#[async_trait]
impl<C: PayloadCodec> Publisher for RabbitMQPublisher<C> {
    async fn publish(
        &self,
        ctx: &Context,
        envelope: &Envelope,
        binding: &BindingDescriptor,
    ) -> Result<(), AmqpError> {
        binding.validate_for_publish()?;
        ensure_no_reserved(&envelope.headers)?;

        let outgoing = self.outgoing(ctx, envelope, binding);
        let channel = self.provider.channel().await?;

        let mut topology = AmqpTopology::new(channel.clone());
        topology = match binding.exchange_definition() {
            Some(exchange) => topology.exchange(exchange),
            None => topology.queue(binding.queue_definition()),
        };

        let result = match topology.install().await {
            Ok(_) => {
                channel
                    .publish(binding.exchange_name(), binding.routing_key(), &outgoing)
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close publisher channel");
        }

        match result {
            Ok(()) => {
                debug!(
                    "published to exchange: '{}' with key: '{}'",
                    binding.exchange_name(),
                    binding.routing_key()
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{AmqpChannel, AmqpConnection, MockAmqpChannel, MockAmqpConnection, MockConnector},
        codec::JSON_CONTENT_TYPE,
        exchange::ExchangeKind,
        headers::{HeaderSpec, HeaderValue, Headers, AMQP_HEADERS_X_MATCH},
        memory::MemoryBroker,
    };
    use std::collections::BTreeMap;

    fn provider_with_channel(channel: MockAmqpChannel) -> Arc<ConnectionProvider> {
        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let mut connection = MockAmqpConnection::new();
        connection.expect_is_connected().return_const(true);
        connection
            .expect_create_channel()
            .times(1)
            .returning(move || Ok(channel.clone()));
        let connection: Arc<dyn AmqpConnection> = Arc::new(connection);

        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(move || Ok(connection.clone()));

        ConnectionProvider::new(Arc::new(connector))
    }

    fn untouched_provider() -> Arc<ConnectionProvider> {
        let mut connector = MockConnector::new();
        connector.expect_connect().never();
        ConnectionProvider::new(Arc::new(connector))
    }

    #[tokio::test]
    async fn should_publish_to_queue_through_default_exchange() {
        let broker = MemoryBroker::new();
        let publisher = RabbitMQPublisher::new(ConnectionProvider::new(broker.connector()));

        publisher
            .publish(
                &Context::new(),
                &Envelope::new("hello"),
                &BindingDescriptor::queue("simple-queue"),
            )
            .await
            .unwrap();

        assert_eq!(broker.ready_count("simple-queue"), Some(1));
    }

    #[tokio::test]
    async fn should_declare_exchange_of_binding_kind() {
        let broker = MemoryBroker::new();
        let publisher = RabbitMQPublisher::new(ConnectionProvider::new(broker.connector()));

        publisher
            .publish(
                &Context::new(),
                &Envelope::new("created"),
                &BindingDescriptor::topic("orders", "order.created"),
            )
            .await
            .unwrap();

        assert_eq!(broker.exchange_kind("orders"), Some(ExchangeKind::Topic));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn should_reject_reserved_header_without_contacting_broker() {
        let publisher = RabbitMQPublisher::new(untouched_provider());
        let envelope = Envelope::new("x").header(AMQP_HEADERS_X_MATCH, "any");

        let result = publisher
            .publish(
                &Context::new(),
                &envelope,
                &BindingDescriptor::queue("simple-queue"),
            )
            .await;

        assert!(matches!(result, Err(AmqpError::ReservedHeader(_))));
    }

    #[tokio::test]
    async fn should_reject_incomplete_binding() {
        let publisher = RabbitMQPublisher::new(untouched_provider());

        let result = publisher
            .publish(
                &Context::new(),
                &Envelope::new("x"),
                &BindingDescriptor::direct("", "key"),
            )
            .await;

        assert!(matches!(result, Err(AmqpError::InvalidBinding(_))));
    }

    #[tokio::test]
    async fn should_fail_encoding_before_broker() {
        let publisher = RabbitMQPublisher::new(untouched_provider());

        let result = publisher
            .publish_value(
                &Context::new(),
                &BTreeMap::from([(vec![1u8], 1u8)]),
                &BindingDescriptor::queue("numbers"),
            )
            .await;

        assert!(matches!(result, Err(AmqpError::SerializationError(_))));
    }

    #[tokio::test]
    async fn should_merge_header_spec_and_default_expiration() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
            .expect_publish()
            .withf(|exchange, key, envelope| {
                exchange.to_string() == "accounts"
                    && key.to_string().is_empty()
                    && envelope.headers.get("account") == Some(&HeaderValue::from("new"))
                    && envelope.headers.get("region") == Some(&HeaderValue::from("eu"))
                    && envelope.headers.get(AMQP_HEADERS_X_MATCH) == Some(&HeaderValue::from("all"))
                    && envelope.ttl_millis == Some(5_000)
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let spec = HeaderSpec::all(Headers::from([(
            "account".to_owned(),
            HeaderValue::from("new"),
        )]))
        .unwrap();
        let binding = BindingDescriptor::headers("accounts", spec).ttl(5_000);

        let publisher = RabbitMQPublisher::new(provider_with_channel(channel));
        publisher
            .publish(
                &Context::new(),
                &Envelope::new("{}").header("region", "eu"),
                &binding,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_keep_envelope_expiration() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_publish()
            .withf(|_, _, envelope| envelope.ttl_millis == Some(1_000))
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let publisher = RabbitMQPublisher::new(provider_with_channel(channel));
        publisher
            .publish(
                &Context::new(),
                &Envelope::new("x").ttl(1_000),
                &BindingDescriptor::queue("q"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_stamp_json_content_type() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_publish()
            .withf(|_, _, envelope| {
                envelope.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
                    && envelope.payload == br#"{"id":7}"#.to_vec()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let publisher = RabbitMQPublisher::new(provider_with_channel(channel));
        publisher
            .publish_value(
                &Context::new(),
                &BTreeMap::from([("id", 7)]),
                &BindingDescriptor::queue("orders"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_keep_caller_content_type() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_publish()
            .withf(|_, _, envelope| envelope.content_type.as_deref() == Some("text/plain"))
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let publisher = RabbitMQPublisher::new(provider_with_channel(channel));
        publisher
            .publish(
                &Context::new(),
                &Envelope::new("hello").content_type("text/plain"),
                &BindingDescriptor::queue("orders"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_close_channel_when_publish_fails() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_declare_exchange().returning(|_| Ok(()));
        channel
            .expect_publish()
            .returning(|_, _, _| Err(AmqpError::PublishingError("closed".to_owned())));
        channel.expect_close().times(1).returning(|| Ok(()));

        let publisher = RabbitMQPublisher::new(provider_with_channel(channel));
        let result = publisher
            .publish(
                &Context::new(),
                &Envelope::new("x"),
                &BindingDescriptor::fanout("audit"),
            )
            .await;

        assert_eq!(
            result,
            Err(AmqpError::PublishingError("closed".to_owned()))
        );
    }
}
