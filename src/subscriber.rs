// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Subscriber
//!
//! This module consumes a queue described by a binding descriptor and hands
//! every delivery to a handler. The handler's answer gates the
//! acknowledgement: `true` acks the delivery tag, `false` leaves it
//! unacknowledged so it stays on the broker until the channel closes.
//!
//! Each subscription runs on its own channel, with a per-consumer prefetch
//! window, and processes deliveries on a dedicated task fed by the broker
//! driver. The task also opens an OpenTelemetry consumer span per delivery.

use crate::{
    binding::BindingDescriptor,
    broker::{AmqpChannel, Delivery, DeliveryReceiver},
    codec::{JsonCodec, PayloadCodec},
    configs::RabbitMQConfigs,
    connection::ConnectionProvider,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage, FnHandler},
    otel,
    subscription::SubscriptionHandle,
    topology::{AmqpTopology, Topology},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Prefetch window of subscriptions started without an explicit one
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Settlement of deliveries whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeFailurePolicy {
    /// Negative-ack without requeue: the broker dead-letters or drops it
    #[default]
    Reject,
    /// Negative-ack with requeue
    Requeue,
}

/// Starts consumers bound according to binding descriptors.
pub struct Subscriber<C = JsonCodec> {
    provider: Arc<ConnectionProvider>,
    codec: C,
    decode_failure: DecodeFailurePolicy,
    prefetch: u16,
}

impl Subscriber<JsonCodec> {
    pub fn new(provider: Arc<ConnectionProvider>) -> Subscriber<JsonCodec> {
        Subscriber::with_codec(provider, JsonCodec)
    }
}

impl<C: PayloadCodec + Clone> Subscriber<C> {
    pub fn with_codec(provider: Arc<ConnectionProvider>, codec: C) -> Subscriber<C> {
        Subscriber {
            provider,
            codec,
            decode_failure: DecodeFailurePolicy::default(),
            prefetch: DEFAULT_PREFETCH_COUNT,
        }
    }

    pub fn decode_failure(mut self, policy: DecodeFailurePolicy) -> Self {
        self.decode_failure = policy;
        self
    }

    /// Prefetch window used by `subscribe_default` and `subscribe_fn_default`.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Takes the default prefetch window from `cfg`.
    pub fn configure(self, cfg: &RabbitMQConfigs) -> Self {
        self.prefetch(cfg.prefetch_count)
    }

    /// Subscribes with the subscriber's default prefetch window.
    pub async fn subscribe_default(
        &self,
        binding: &BindingDescriptor,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<SubscriptionHandle, AmqpError> {
        self.subscribe(binding, handler, self.prefetch).await
    }

    /// Declares the binding's topology and starts consuming its queue.
    ///
    /// Setup failures close the channel before returning.
    ///
    /// # Parameters
    /// * `binding` - Queue to consume and how it is bound, the queue name is required
    /// * `handler` - Decides the acknowledgement of every delivery
    /// * `prefetch` - Most deliveries outstanding at once, must be positive
    ///
    /// # Returns
    /// A handle owning the consumer until it is released or dropped
    pub async fn subscribe(
        &self,
        binding: &BindingDescriptor,
        handler: Arc<dyn ConsumerHandler>,
        prefetch: u16,
    ) -> Result<SubscriptionHandle, AmqpError> {
        binding.validate_for_subscribe()?;

        if prefetch == 0 {
            return Err(AmqpError::InvalidBinding(
                "prefetch must be greater than zero".to_owned(),
            ));
        }

        let channel = self.provider.channel().await?;

        match self.start(&channel, binding, handler, prefetch).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                error!(error = err.to_string(), "failure to subscribe");

                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close subscriber channel");
                }

                Err(err)
            }
        }
    }

    /// Subscribes a typed closure. Payloads are decoded with the subscriber
    /// codec and undecodable ones are settled by the decode failure policy.
    pub async fn subscribe_fn<T, F, Fut>(
        &self,
        binding: &BindingDescriptor,
        prefetch: u16,
        func: F,
    ) -> Result<SubscriptionHandle, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handler: Arc<FnHandler<C, T, F>> = Arc::new(FnHandler::new(self.codec.clone(), func));
        self.subscribe(binding, handler, prefetch).await
    }

    /// `subscribe_fn` with the subscriber's default prefetch window.
    pub async fn subscribe_fn_default<T, F, Fut>(
        &self,
        binding: &BindingDescriptor,
        func: F,
    ) -> Result<SubscriptionHandle, AmqpError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.subscribe_fn(binding, self.prefetch, func).await
    }

    async fn start(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        binding: &BindingDescriptor,
        handler: Arc<dyn ConsumerHandler>,
        prefetch: u16,
    ) -> Result<SubscriptionHandle, AmqpError> {
        AmqpTopology::for_binding(channel.clone(), binding)
            .install()
            .await?;

        channel.qos(prefetch, false).await?;

        let queue = binding.queue_name().to_owned();
        let consumer_tag = format!("{}.{}", queue, Uuid::new_v4());
        let deliveries = channel.consume(&queue, &consumer_tag, false).await?;

        debug!("consuming queue: {} as {}", queue, consumer_tag);

        let task = spawn_consumer(
            channel.clone(),
            &queue,
            deliveries,
            handler,
            self.decode_failure,
        );

        Ok(SubscriptionHandle::new(
            channel.clone(),
            &queue,
            &consumer_tag,
            task,
        ))
    }
}

/// Runs the delivery loop of a consumer until the broker driver stops
/// feeding it. Deliveries are processed one at a time, in arrival order.
pub(crate) fn spawn_consumer(
    channel: Arc<dyn AmqpChannel>,
    queue: &str,
    mut deliveries: DeliveryReceiver,
    handler: Arc<dyn ConsumerHandler>,
    policy: DecodeFailurePolicy,
) -> JoinHandle<()> {
    let queue = queue.to_owned();

    tokio::spawn(async move {
        let tracer = global::tracer("amqp consumer");

        while let Some(delivery) = deliveries.recv().await {
            if let Err(err) = consume(&tracer, &queue, delivery, &handler, &channel, policy).await {
                error!(error = err.to_string(), "error consume msg");
            }
        }

        debug!("consumer of queue: {} stopped", queue);
    })
}

/// Runs the handler for one delivery and settles it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: Delivery,
    handler: &Arc<dyn ConsumerHandler>,
    channel: &Arc<dyn AmqpChannel>,
    policy: DecodeFailurePolicy,
) -> Result<(), AmqpError> {
    let tag = delivery.delivery_tag;
    let (ctx, mut span) = otel::new_span(&delivery.envelope.headers, tracer, queue);

    debug!(
        "received: {} - exchange: '{}' key: '{}'",
        tag, delivery.exchange, delivery.routing_key
    );

    let msg = ConsumerMessage::new(queue, delivery);
    let outcome = AssertUnwindSafe(handler.exec(&ctx, &msg))
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(true)) => match channel.ack(tag).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                error!("error whiling ack msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(err)
            }
        },

        Ok(Ok(false)) => {
            debug!("message left unacknowledged");
            Ok(())
        }

        Ok(Err(AmqpError::ParsePayloadError(reason))) => {
            let requeue = policy == DecodeFailurePolicy::Requeue;
            warn!(reason = reason.as_str(), requeue, "rejecting undecodable message");

            span.record_error(&AmqpError::ParsePayloadError(reason));
            span.set_status(Status::Error {
                description: Cow::from("undecodable payload"),
            });

            channel.nack(tag, requeue).await.map_err(|err| {
                error!("error whiling nack msg");
                err
            })
        }

        Ok(Err(err)) => {
            warn!(error = err.to_string(), "handler failure, message left unacknowledged");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            Ok(())
        }

        Err(_) => {
            let err = AmqpError::HandlerError("handler panicked".to_owned());
            error!(error = err.to_string(), "message left unacknowledged");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler panicked"),
            });
            Ok(())
        }
    }
}
