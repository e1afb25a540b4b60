// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Descriptor
//!
//! Pure data describing how a queue is reached: the exchange kind, the
//! routing key or header criteria the kind needs, and the TTL. Publishers
//! and subscribers both dispatch on it.

use crate::{
    configs::RabbitMQConfigs,
    envelope::DEFAULT_TTL_MILLIS,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    headers::{HeaderSpec, Headers},
    queue::{QueueBinding, QueueDefinition},
};

/// The routing data of a binding. Each variant carries exactly what its
/// exchange kind matches on.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Default exchange, routed by queue name
    Queue,
    Direct { routing_key: String },
    /// Pattern of dot separated words, `*` matches one word and `#` any number
    Topic { pattern: String },
    /// The key is carried for compatibility, brokers ignore it
    Fanout { routing_key: String },
    Headers(HeaderSpec),
}

/// Declares how a queue is reached.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingDescriptor {
    pub(crate) exchange: String,
    pub(crate) queue: String,
    pub(crate) route: Route,
    pub(crate) ttl_millis: u32,
}

impl BindingDescriptor {
    fn with_route(exchange: &str, route: Route) -> BindingDescriptor {
        BindingDescriptor {
            exchange: exchange.to_owned(),
            queue: String::new(),
            route,
            ttl_millis: DEFAULT_TTL_MILLIS,
        }
    }

    /// Publish straight to `queue` through the default exchange.
    pub fn queue(queue: &str) -> BindingDescriptor {
        BindingDescriptor::with_route("", Route::Queue).on_queue(queue)
    }

    /// Creates a binding on a direct exchange.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    /// * `routing_key` - Key a message must carry exactly to reach the queue
    ///
    /// # Returns
    /// A descriptor without queue, enough to publish. Subscribers name the
    /// queue with `on_queue`.
    pub fn direct(exchange: &str, routing_key: &str) -> BindingDescriptor {
        BindingDescriptor::with_route(
            exchange,
            Route::Direct {
                routing_key: routing_key.to_owned(),
            },
        )
    }

    /// Creates a binding on a topic exchange.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    /// * `pattern` - Binding pattern for subscribers, the literal key for publishers
    pub fn topic(exchange: &str, pattern: &str) -> BindingDescriptor {
        BindingDescriptor::with_route(
            exchange,
            Route::Topic {
                pattern: pattern.to_owned(),
            },
        )
    }

    /// Broadcast to every queue bound to `exchange`.
    pub fn fanout(exchange: &str) -> BindingDescriptor {
        BindingDescriptor::fanout_with_key(exchange, "")
    }

    pub fn fanout_with_key(exchange: &str, routing_key: &str) -> BindingDescriptor {
        BindingDescriptor::with_route(
            exchange,
            Route::Fanout {
                routing_key: routing_key.to_owned(),
            },
        )
    }

    /// Creates a binding on a headers exchange.
    ///
    /// # Parameters
    /// * `exchange` - Name of the exchange
    /// * `spec` - Header criteria, merged into published message headers and
    ///   used as binding arguments by subscribers
    pub fn headers(exchange: &str, spec: HeaderSpec) -> BindingDescriptor {
        BindingDescriptor::with_route(exchange, Route::Headers(spec))
    }

    /// Names the queue a subscriber binds and consumes.
    pub fn on_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Sets the TTL of the exchange and the default expiration of messages
    /// published on this binding.
    ///
    /// # Parameters
    /// * `ttl_millis` - TTL in milliseconds
    pub fn ttl(mut self, ttl_millis: u32) -> Self {
        self.ttl_millis = ttl_millis;
        self
    }

    /// Takes the TTL from `cfg`. Publisher and subscriber of an exchange
    /// must agree on it, since the broker refuses a redeclaration with other
    /// arguments.
    pub fn configure(self, cfg: &RabbitMQConfigs) -> Self {
        self.ttl(cfg.message_ttl_ms)
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn ttl_millis(&self) -> u32 {
        self.ttl_millis
    }

    /// Exchange kind implied by the route.
    pub fn kind(&self) -> ExchangeKind {
        match self.route {
            Route::Queue => ExchangeKind::None,
            Route::Direct { .. } => ExchangeKind::Direct,
            Route::Topic { .. } => ExchangeKind::Topic,
            Route::Fanout { .. } => ExchangeKind::Fanout,
            Route::Headers(_) => ExchangeKind::Headers,
        }
    }

    /// Routing key a publisher sends with.
    pub fn routing_key(&self) -> &str {
        match &self.route {
            Route::Queue => &self.queue,
            Route::Direct { routing_key } => routing_key,
            Route::Topic { pattern } => pattern,
            Route::Fanout { routing_key } => routing_key,
            Route::Headers(_) => "",
        }
    }

    /// Binding arguments, the augmented header criteria for headers routes.
    pub fn binding_arguments(&self) -> Headers {
        match &self.route {
            Route::Headers(spec) => spec.match_headers(),
            _ => Headers::default(),
        }
    }

    /// Checks the data a publisher needs is present.
    pub fn validate_for_publish(&self) -> Result<(), AmqpError> {
        match self.route {
            Route::Queue if self.queue.is_empty() => {
                Err(AmqpError::InvalidBinding("queue not set".to_owned()))
            }
            Route::Queue => Ok(()),
            _ if self.exchange.is_empty() => {
                Err(AmqpError::InvalidBinding("exchange not set".to_owned()))
            }
            _ => Ok(()),
        }
    }

    /// Checks the data a subscriber needs is present.
    pub fn validate_for_subscribe(&self) -> Result<(), AmqpError> {
        self.validate_for_publish()?;

        if self.queue.is_empty() {
            return Err(AmqpError::InvalidBinding("queue not set".to_owned()));
        }

        Ok(())
    }

    /// Exchange to declare, absent for the default exchange.
    pub(crate) fn exchange_definition(&self) -> Option<ExchangeDefinition> {
        match self.kind() {
            ExchangeKind::None => None,
            kind => Some(
                ExchangeDefinition::new(&self.exchange)
                    .kind(kind)
                    .ttl(self.ttl_millis),
            ),
        }
    }

    /// Durable, shared queue consumed by subscribers and targeted by queue publishes.
    pub(crate) fn queue_definition(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue).durable()
    }

    /// Binding of the queue to the exchange, absent for the default exchange.
    pub(crate) fn queue_binding(&self) -> Option<QueueBinding> {
        match self.kind() {
            ExchangeKind::None => None,
            _ => Some(
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(self.routing_key())
                    .arguments(self.binding_arguments()),
            ),
        }
    }
}
