// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Protocol Surface
//!
//! The subset of the AMQP protocol this layer consumes, expressed as traits so
//! that the messaging components do not depend on a particular client library.
//!
//! - `Connector`: establishes a broker connection
//! - `AmqpConnection`: a live connection handing out channels
//! - `AmqpChannel`: declare, bind, publish, consume and acknowledge
//!
//! Deliveries are pushed by the broker driver into an mpsc channel; the
//! consumer side reads them on its own task.

use crate::{
    envelope::Envelope,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Inbound side of a consumer, fed by the broker driver.
pub type DeliveryReceiver = mpsc::UnboundedReceiver<Delivery>;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub envelope: Envelope,
}

/// Establishes broker connections.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live broker connection.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Opens a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A broker channel. Declarations are idempotent.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, generated by the broker when
    /// the definition leaves it empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Bounds unacknowledged deliveries. `global = false` applies the bound
    /// to each consumer started afterwards instead of the whole channel.
    async fn qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    /// Publishes on `exchange`, the empty name being the default exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer. With `auto_ack` the broker settles deliveries itself.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryReceiver, AmqpError>;

    /// Acknowledges exactly one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), AmqpError>;

    /// Closes the channel. Unacknowledged deliveries return to their queues.
    async fn close(&self) -> Result<(), AmqpError>;
}
