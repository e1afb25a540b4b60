// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module holds the one broker connection a process shares. The
//! connection slot is guarded by an async mutex so concurrent first callers
//! never dial twice; every later caller gets the cached connection back.
//! Channels are never shared: each operation opens its own.

use crate::{
    broker::{AmqpChannel, AmqpConnection, Connector},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    rabbitmq::RabbitMQConnector,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Lazily establishes and hands back the shared broker connection.
pub struct ConnectionProvider {
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<Arc<dyn AmqpConnection>>>,
}

impl ConnectionProvider {
    /// Creates a provider that has not connected yet.
    ///
    /// # Parameters
    /// * `connector` - Dials the broker, `RabbitMQConnector` or an in-process broker
    ///
    /// # Returns
    /// The provider, shared by every publisher, subscriber and RPC peer
    pub fn new(connector: Arc<dyn Connector>) -> Arc<ConnectionProvider> {
        Arc::new(ConnectionProvider {
            connector,
            slot: Mutex::new(None),
        })
    }

    /// Provider dialing the RabbitMQ server described by `cfg`.
    pub fn rabbitmq(cfg: &RabbitMQConfigs) -> Arc<ConnectionProvider> {
        ConnectionProvider::new(RabbitMQConnector::new(cfg))
    }

    /// Returns the live connection, establishing it on first use.
    ///
    /// Idempotent: repeated calls return the same connection while it stays
    /// connected. A failed dial is returned as `ConnectionError` and is not
    /// retried.
    pub async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut slot = self.slot.lock().await;

        if let Some(conn) = slot.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            debug!("cached connection is no longer connected");
        }

        let conn = self.connector.connect().await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            err
        })?;

        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Opens a fresh channel on the shared connection.
    pub async fn channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.connect().await?.create_channel().await
    }

    /// Closes the shared connection. Nothing to do when none was established.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.slot.lock().await.take();

        match conn {
            Some(conn) => {
                debug!("closing amqp connection");
                conn.close().await
            }
            None => Ok(()),
        }
    }
}
