// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Driver
//!
//! This module implements the broker traits on top of `lapin`. It handles
//! connecting to a RabbitMQ server, creating channels, and translating
//! envelopes to and from AMQP basic properties. Consumer streams are drained
//! by a forwarding task into the mpsc channel handed back to the caller.

use crate::{
    broker::{AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryReceiver},
    configs::RabbitMQConfigs,
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::{from_field_table, to_field_table},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// AMQP delivery mode of messages that survive a broker restart
pub const AMQP_PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode of messages kept in memory only
pub const AMQP_TRANSIENT_DELIVERY_MODE: u8 = 1;
/// Reply code of a normal shutdown
const AMQP_REPLY_SUCCESS: u16 = 200;

/// Dials a RabbitMQ server with the configured URI.
pub struct RabbitMQConnector {
    uri: String,
    connection_name: String,
}

impl RabbitMQConnector {
    pub fn new(cfg: &RabbitMQConfigs) -> Arc<RabbitMQConnector> {
        Arc::new(RabbitMQConnector {
            uri: cfg.uri(),
            connection_name: cfg.connection_name.clone(),
        })
    }
}

#[async_trait]
impl Connector for RabbitMQConnector {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(RabbitMQConnection { conn }))
    }
}

/// A lapin connection.
pub struct RabbitMQConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for RabbitMQConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(RabbitMQChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(AMQP_REPLY_SUCCESS, "closing connection")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

/// A lapin channel.
pub struct RabbitMQChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for RabbitMQChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let kind: lapin::ExchangeKind = def.kind.try_into()?;

        self.channel
            .exchange_declare(
                &def.name,
                kind,
                ExchangeDeclareOptions::default(),
                to_field_table(&def.params),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(err.to_string())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(queue.name().as_str().to_owned()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                to_field_table(&binding.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &envelope.payload,
                properties_for(envelope),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryReceiver, AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(err.to_string()))
            }
            Ok(c) => Ok(c),
        }?;

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(mut delivery) => {
                        let payload = std::mem::take(&mut delivery.data);
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_owned(),
                            routing_key: delivery.routing_key.as_str().to_owned(),
                            redelivered: delivery.redelivered,
                            envelope: envelope_from(payload, &delivery.properties),
                        };

                        if tx.send(delivery).is_err() {
                            debug!("delivery receiver dropped, stop forwarding");
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError(err.to_string())
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError(err.to_string())
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(err.to_string())
            })
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to delete the queue");
                Err(AmqpError::DeleteQueueError(err.to_string()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(AMQP_REPLY_SUCCESS, "closing channel")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}

/// Basic properties carrying the metadata of an envelope.
pub(crate) fn properties_for(envelope: &Envelope) -> BasicProperties {
    let delivery_mode = if envelope.persistent {
        AMQP_PERSISTENT_DELIVERY_MODE
    } else {
        AMQP_TRANSIENT_DELIVERY_MODE
    };

    let mut props = BasicProperties::default()
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_delivery_mode(delivery_mode)
        .with_headers(to_field_table(&envelope.headers));

    if let Some(ttl) = envelope.ttl_millis {
        props = props.with_expiration(ShortString::from(ttl.to_string()));
    }
    if let Some(content_type) = &envelope.content_type {
        props = props.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(id) = &envelope.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(queue) = &envelope.reply_to {
        props = props.with_reply_to(ShortString::from(queue.clone()));
    }

    props
}

/// Rebuilds the envelope of an inbound message.
pub(crate) fn envelope_from(payload: Vec<u8>, props: &BasicProperties) -> Envelope {
    Envelope {
        payload,
        headers: props
            .headers()
            .as_ref()
            .map(from_field_table)
            .unwrap_or_default(),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str().to_owned()),
        reply_to: props.reply_to().as_ref().map(|queue| queue.as_str().to_owned()),
        persistent: *props.delivery_mode() == Some(AMQP_PERSISTENT_DELIVERY_MODE),
        content_type: props
            .content_type()
            .as_ref()
            .map(|content_type| content_type.as_str().to_owned()),
        ttl_millis: props
            .expiration()
            .as_ref()
            .and_then(|ttl| ttl.as_str().parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{JsonCodec, JSON_CONTENT_TYPE},
        headers::HeaderValue,
    };

    #[test]
    fn should_carry_rpc_metadata_in_properties() {
        let envelope = Envelope::new("req")
            .transient()
            .correlation_id("abc")
            .reply_to("amq.gen-1");

        let props = properties_for(&envelope);

        assert_eq!(props.delivery_mode(), &Some(AMQP_TRANSIENT_DELIVERY_MODE));
        assert_eq!(props.correlation_id(), &Some(ShortString::from("abc")));
        assert_eq!(props.reply_to(), &Some(ShortString::from("amq.gen-1")));
        assert_eq!(props.expiration(), &None);
        assert!(props.message_id().is_some());
    }

    #[test]
    fn should_render_ttl_as_string_milliseconds() {
        let props = properties_for(&Envelope::new("x").ttl(30_000));

        assert_eq!(props.expiration(), &Some(ShortString::from("30000")));
        assert_eq!(props.delivery_mode(), &Some(AMQP_PERSISTENT_DELIVERY_MODE));
    }

    #[test]
    fn should_rebuild_envelope_from_properties() {
        let envelope = Envelope::new("hello")
            .content_type(JSON_CONTENT_TYPE)
            .header("account", "new")
            .ttl(500)
            .correlation_id("abc")
            .reply_to("replies");

        let rebuilt = envelope_from(b"hello".to_vec(), &properties_for(&envelope));

        assert_eq!(rebuilt, envelope);
        assert_eq!(
            rebuilt.headers.get("account"),
            Some(&HeaderValue::from("new"))
        );
    }

    #[test]
    fn should_stamp_codec_content_type() {
        let envelope = Envelope::encode(&JsonCodec, &[1, 2]).unwrap();

        let props = properties_for(&envelope);

        assert_eq!(
            props.content_type(),
            &Some(ShortString::from("application/json"))
        );
        assert_eq!(properties_for(&Envelope::new("raw")).content_type(), &None);
    }

    #[test]
    fn should_default_missing_properties() {
        let envelope = envelope_from(vec![], &BasicProperties::default());

        assert!(!envelope.persistent);
        assert!(envelope.headers.is_empty());
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.ttl_millis.is_none());
    }
}
