// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Server
//!
//! Serves requests arriving on a queue, one at a time. Every request that
//! names a reply queue gets exactly one reply carrying its correlation id:
//! when the request cannot be decoded, or the handler fails or panics, the
//! reply holds the response type's default value. Requests are acknowledged
//! after the reply attempt, whatever its outcome.

use crate::{
    broker::AmqpChannel,
    codec::{JsonCodec, PayloadCodec},
    connection::ConnectionProvider,
    envelope::Envelope,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    queue::QueueDefinition,
    subscriber::{spawn_consumer, DecodeFailurePolicy},
    subscription::SubscriptionHandle,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt::Display, future::Future, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub struct RpcServer<C = JsonCodec> {
    provider: Arc<ConnectionProvider>,
    codec: C,
}

impl RpcServer<JsonCodec> {
    pub fn new(provider: Arc<ConnectionProvider>) -> RpcServer<JsonCodec> {
        RpcServer::with_codec(provider, JsonCodec)
    }
}

impl<C: PayloadCodec + Clone> RpcServer<C> {
    pub fn with_codec(provider: Arc<ConnectionProvider>, codec: C) -> RpcServer<C> {
        RpcServer { provider, codec }
    }

    /// Starts serving `queue` with `handler`.
    ///
    /// The queue is declared non-durable and requests are processed with a
    /// prefetch of one.
    pub async fn handle<Req, Resp, E, F, Fut>(
        &self,
        queue: &str,
        handler: F,
    ) -> Result<SubscriptionHandle, AmqpError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Default + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        if queue.is_empty() {
            return Err(AmqpError::InvalidBinding("queue not set".to_owned()));
        }

        let channel = self.provider.channel().await?;

        let responder: Arc<Responder<C, Req, Resp, F>> = Arc::new(Responder {
            codec: self.codec.clone(),
            func: handler,
            channel: channel.clone(),
            _types: PhantomData,
        });

        match self.start(&channel, queue, responder).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                error!(error = err.to_string(), "failure to start rpc server");

                if let Err(err) = channel.close().await {
                    warn!(error = err.to_string(), "failure to close rpc server channel");
                }

                Err(err)
            }
        }
    }

    async fn start(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        queue: &str,
        responder: Arc<dyn ConsumerHandler>,
    ) -> Result<SubscriptionHandle, AmqpError> {
        channel.declare_queue(&QueueDefinition::new(queue)).await?;
        channel.qos(1, false).await?;

        let consumer_tag = format!("{}.rpc.{}", queue, Uuid::new_v4());
        let deliveries = channel.consume(queue, &consumer_tag, false).await?;

        debug!("serving rpc requests on queue: {}", queue);

        let task = spawn_consumer(
            channel.clone(),
            queue,
            deliveries,
            responder,
            DecodeFailurePolicy::Reject,
        );

        Ok(SubscriptionHandle::new(
            channel.clone(),
            queue,
            &consumer_tag,
            task,
        ))
    }
}

/// Turns requests into replies on the server channel.
struct Responder<C, Req, Resp, F> {
    codec: C,
    func: F,
    channel: Arc<dyn AmqpChannel>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<C, Req, Resp, E, F, Fut> Responder<C, Req, Resp, F>
where
    C: PayloadCodec,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Default + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, E>> + Send,
{
    async fn respond(&self, request: &Envelope) -> Resp {
        let Ok(request) = self.codec.decode::<Req>(&request.payload) else {
            warn!("undecodable rpc request, replying with default response");
            return Resp::default();
        };

        match AssertUnwindSafe(async move { (self.func)(request).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                error!(error = err.to_string(), "rpc handler failure");
                Resp::default()
            }
            Err(_) => {
                error!("rpc handler panicked");
                Resp::default()
            }
        }
    }
}

#[async_trait]
impl<C, Req, Resp, E, F, Fut> ConsumerHandler for Responder<C, Req, Resp, F>
where
    C: PayloadCodec,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Default + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, E>> + Send,
{
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<bool, AmqpError> {
        let request = msg.envelope();
        let response = self.respond(request).await;

        let Some(reply_to) = request.reply_to.as_deref() else {
            warn!("rpc request without reply queue, nothing to answer");
            return Ok(true);
        };

        let payload = match self.codec.encode(&response) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = err.to_string(), "failure to encode rpc response");
                return Ok(true);
            }
        };

        let mut reply = Envelope::new(payload)
            .transient()
            .content_type(self.codec.content_type());
        reply.correlation_id = request.correlation_id.clone();
        otel::inject(ctx, &mut reply.headers);

        if let Err(err) = self.channel.publish("", reply_to, &reply).await {
            error!(error = err.to_string(), "failure to publish rpc reply");
        }

        Ok(true)
    }
}
