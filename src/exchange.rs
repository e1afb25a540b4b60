// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for defining exchanges. Exchanges are the
//! routing mechanism that determines how a published message is distributed
//! to bound queues. The closed `ExchangeKind` enum also carries the `None`
//! case, which addresses a queue directly through the default exchange.

use crate::{
    errors::AmqpError,
    headers::{HeaderValue, Headers},
};

/// Constant for the argument carrying the exchange level message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Represents the ways a message can be routed.
///
/// Each kind has specific routing behavior:
/// - None: no exchange, the routing key is the name of the target queue
/// - Direct: routes to queues whose binding key equals the routing key
/// - Topic: routes by `*` / `#` wildcard matching of dot separated keys
/// - Fanout: broadcasts to every bound queue regardless of routing key
/// - Headers: routes on message header values instead of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    #[default]
    None,
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl TryFrom<ExchangeKind> for lapin::ExchangeKind {
    type Error = AmqpError;

    /// Converts the kind to lapin's exchange kind.
    ///
    /// `None` has no broker side exchange to declare and is rejected.
    fn try_from(kind: ExchangeKind) -> Result<lapin::ExchangeKind, AmqpError> {
        match kind {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::None => Err(AmqpError::DeclareExchangeError(
                "the default exchange cannot be declared".to_owned(),
            )),
        }
    }
}

/// An exchange to declare before publishing or binding.
///
/// Exchanges are declared transient and kept once their queues are unbound,
/// matching the queues a binding descriptor declares alongside them.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) params: Headers,
}

impl ExchangeDefinition {
    /// Creates a direct exchange definition.
    ///
    /// # Parameters
    /// * `name` - Name of the exchange, must not be empty
    ///
    /// # Returns
    /// A definition without arguments, to be refined with `kind` and `ttl`
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            params: Headers::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Declare arguments, such as `x-message-ttl`.
    pub fn arguments(&self) -> &Headers {
        &self.params
    }

    /// Sets the routing behavior of the exchange.
    ///
    /// # Parameters
    /// * `kind` - Any kind but `None`, which cannot be declared
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange level message TTL argument.
    ///
    /// # Parameters
    /// * `ttl` - TTL in milliseconds
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.params.insert(
            AMQP_HEADERS_MESSAGE_TTL.to_owned(),
            HeaderValue::Int(i64::from(ttl)),
        );
        self
    }
}
