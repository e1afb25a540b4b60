// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares the broker objects a binding needs before messages can
//! flow: exchanges, queues, and the bindings between them. Declarations are
//! idempotent, so publishers and subscribers install the same topology without
//! coordinating.

use crate::{
    binding::BindingDescriptor,
    broker::AmqpChannel,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Collects broker declarations and installs them in dependency order.
#[async_trait]
pub trait Topology {
    fn exchange(self, def: ExchangeDefinition) -> Self;

    fn queue(self, def: QueueDefinition) -> Self;

    /// Registers a binding. Its queue and exchange must be registered too,
    /// or already exist on the broker.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology: exchanges first, then queues, then bindings.
    ///
    /// Returns the names of the declared queues in registration order, which
    /// differ from the definitions for server-named queues.
    async fn install(&self) -> Result<Vec<String>, AmqpError>;
}

/// Topology installed through a broker channel.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    /// Topology consumers of `binding` rely on: the exchange when the route
    /// has one, the durable queue, and the queue binding.
    pub(crate) fn for_binding(
        channel: Arc<dyn AmqpChannel>,
        binding: &BindingDescriptor,
    ) -> AmqpTopology {
        let mut topology = AmqpTopology::new(channel).queue(binding.queue_definition());

        if let Some(exchange) = binding.exchange_definition() {
            topology = topology.exchange(exchange);
        }

        if let Some(queue_binding) = binding.queue_binding() {
            topology = topology.queue_binding(queue_binding);
        }

        topology
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<Vec<String>, AmqpError> {
        self.install_exchange().await?;
        let names = self.install_queue().await?;
        self.binding_queues().await?;

        Ok(names)
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());
            self.channel.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<Vec<String>, AmqpError> {
        let mut names = Vec::with_capacity(self.queues.len());

        for def in &self.queues {
            let name = self.channel.declare_queue(def).await?;
            debug!("queue: {} was created", name);
            names.push(name);
        }

        Ok(names)
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.queue_name(),
                binding.exchange_name(),
                binding.key()
            );

            self.channel.bind_queue(binding).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockAmqpChannel,
        exchange::ExchangeKind,
        headers::{HeaderSpec, HeaderValue, Headers},
        memory::MemoryBroker,
    };
    use mockall::Sequence;

    #[tokio::test]
    async fn should_install_exchange_before_queue_and_binding() {
        let mut seq = Sequence::new();
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "orders" && def.exchange_kind() == ExchangeKind::Direct)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "created" && def.is_durable())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|def| Ok(def.name().to_owned()));
        channel
            .expect_bind_queue()
            .withf(|b| b.queue_name() == "created" && b.key() == "order.created")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let binding = BindingDescriptor::direct("orders", "order.created").on_queue("created");
        let names = AmqpTopology::for_binding(Arc::new(channel), &binding)
            .install()
            .await
            .unwrap();

        assert_eq!(names, vec!["created".to_owned()]);
    }

    #[tokio::test]
    async fn should_stop_on_declaration_failure() {
        let mut channel = MockAmqpChannel::new();

        channel
            .expect_declare_exchange()
            .returning(|_| Err(AmqpError::DeclareExchangeError("orders".to_owned())));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let binding = BindingDescriptor::fanout("orders").on_queue("audit");
        let result = AmqpTopology::for_binding(Arc::new(channel), &binding)
            .install()
            .await;

        assert_eq!(
            result,
            Err(AmqpError::DeclareExchangeError("orders".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_install_plain_queue_without_exchange() {
        let broker = MemoryBroker::new();
        let channel = broker.open_connection().open_channel().unwrap();

        let binding = BindingDescriptor::queue("hello");
        AmqpTopology::for_binding(channel, &binding)
            .install()
            .await
            .unwrap();

        assert_eq!(broker.queue_names(), vec!["hello".to_owned()]);
        assert_eq!(broker.ready_count("hello"), Some(0));
    }

    #[tokio::test]
    async fn should_install_headers_binding() {
        let broker = MemoryBroker::new();
        let channel = broker.open_connection().open_channel().unwrap();

        let spec = HeaderSpec::all(Headers::from([(
            "account".to_owned(),
            HeaderValue::from("new"),
        )]))
        .unwrap();
        let binding = BindingDescriptor::headers("accounts", spec).on_queue("new-accounts");

        AmqpTopology::for_binding(channel, &binding)
            .install()
            .await
            .unwrap();

        assert_eq!(
            broker.exchange_kind("accounts"),
            Some(ExchangeKind::Headers)
        );
        assert_eq!(broker.queue_names(), vec!["new-accounts".to_owned()]);
    }
}
