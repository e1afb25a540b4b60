// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Client
//!
//! Request/reply over queues. Each call runs on its own channel with a
//! server-named, exclusive, auto-delete reply queue. The reply consumer is
//! armed before the request is published, and the first reply settles the
//! call: a matching correlation id resolves it, anything else fails it.
//! Every call carries a deadline.
//!
//! The channel is closed on every exit path, which also disposes the reply
//! queue together with any reply arriving after the call was settled.

use crate::{
    broker::AmqpChannel,
    codec::{JsonCodec, PayloadCodec},
    configs::RabbitMQConfigs,
    connection::ConnectionProvider,
    envelope::Envelope,
    errors::AmqpError,
    otel,
    queue::QueueDefinition,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Deadline of calls made without an explicit one
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(30);

/// An outstanding request: the id its reply must carry and where it arrives.
struct PendingCall {
    correlation_id: String,
    reply_queue: String,
}

pub struct RpcClient<C = JsonCodec> {
    provider: Arc<ConnectionProvider>,
    codec: C,
    deadline: Duration,
}

impl RpcClient<JsonCodec> {
    pub fn new(provider: Arc<ConnectionProvider>) -> RpcClient<JsonCodec> {
        RpcClient::with_codec(provider, JsonCodec)
    }
}

impl<C: PayloadCodec> RpcClient<C> {
    pub fn with_codec(provider: Arc<ConnectionProvider>, codec: C) -> RpcClient<C> {
        RpcClient {
            provider,
            codec,
            deadline: DEFAULT_RPC_DEADLINE,
        }
    }

    /// Default deadline used by `invoke`.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Takes the default deadline from `cfg`.
    pub fn configure(self, cfg: &RabbitMQConfigs) -> Self {
        self.deadline(cfg.rpc_timeout())
    }

    /// Sends `request` to `queue` and waits for the reply within the default deadline.
    pub async fn invoke<Req, Resp>(
        &self,
        ctx: &Context,
        request: &Req,
        queue: &str,
    ) -> Result<Resp, AmqpError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        self.invoke_with_deadline(ctx, request, queue, self.deadline)
            .await
    }

    /// Sends `request` to `queue` and waits at most `deadline` for the reply.
    ///
    /// # Parameters
    /// * `ctx` - Trace context propagated to the server in the request headers
    /// * `request` - Value encoded with the client codec
    /// * `queue` - Queue the server consumes
    /// * `deadline` - Longest wait for the reply
    ///
    /// # Errors
    /// - `SerializationError` when the request cannot be encoded, before any
    ///   broker interaction
    /// - `CorrelationMismatch` when the first reply belongs to another call
    /// - `RpcTimeout` when no reply arrives in time
    /// - `ReplyChannelClosed` when the reply consumer ends without a reply
    /// - `ParsePayloadError` when the matching reply cannot be decoded
    pub async fn invoke_with_deadline<Req, Resp>(
        &self,
        ctx: &Context,
        request: &Req,
        queue: &str,
        deadline: Duration,
    ) -> Result<Resp, AmqpError>
    where
        Req: Serialize + Sync + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = self.codec.encode(request)?;
        let channel = self.provider.channel().await?;

        let result = self.call(ctx, &channel, payload, queue, deadline).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close rpc channel");
        }

        result
    }

    async fn call<Resp: DeserializeOwned>(
        &self,
        ctx: &Context,
        channel: &Arc<dyn AmqpChannel>,
        payload: Vec<u8>,
        queue: &str,
        deadline: Duration,
    ) -> Result<Resp, AmqpError> {
        let pending = PendingCall {
            correlation_id: Uuid::new_v4().to_string(),
            reply_queue: channel
                .declare_queue(&QueueDefinition::server_named())
                .await?,
        };

        let mut replies = channel.consume(&pending.reply_queue, "", true).await?;

        let mut envelope = Envelope::new(payload)
            .content_type(self.codec.content_type())
            .correlation_id(pending.correlation_id.as_str())
            .reply_to(pending.reply_queue.as_str());
        otel::inject(ctx, &mut envelope.headers);

        channel.publish("", queue, &envelope).await?;
        debug!(
            correlation_id = pending.correlation_id.as_str(),
            "rpc request sent to: {}", queue
        );

        let reply = match timeout(deadline, replies.recv()).await {
            Ok(Some(delivery)) => delivery.envelope,
            Ok(None) => {
                error!("reply consumer ended before any reply");
                return Err(AmqpError::ReplyChannelClosed);
            }
            Err(_) => {
                warn!(
                    correlation_id = pending.correlation_id.as_str(),
                    "rpc call to: {} timed out", queue
                );
                return Err(AmqpError::RpcTimeout(deadline.as_millis()));
            }
        };

        match reply.correlation_id {
            Some(received) if received == pending.correlation_id => {
                self.codec.decode(&reply.payload)
            }
            received => {
                let err = AmqpError::CorrelationMismatch {
                    expected: pending.correlation_id,
                    received: received.unwrap_or_default(),
                };
                error!(error = err.to_string(), "reply does not belong to this call");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{AmqpConnection, MockAmqpChannel, MockAmqpConnection, MockConnector},
        memory::MemoryBroker,
    };
    use serde::Deserialize;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sum {
        total: i64,
    }

    /// Answers every request on `queue` with `responder`.
    async fn responder<F>(broker: &MemoryBroker, queue: &str, responder: F)
    where
        F: Fn(&Envelope) -> Envelope + Send + 'static,
    {
        let channel = broker.open_connection().open_channel().unwrap();
        channel
            .declare_queue(&QueueDefinition::new(queue))
            .await
            .unwrap();
        let mut requests = channel.consume(queue, "", true).await.unwrap();

        tokio::spawn(async move {
            while let Some(delivery) = requests.recv().await {
                let reply = responder(&delivery.envelope);
                if let Some(reply_to) = delivery.envelope.reply_to.as_deref() {
                    channel.publish("", reply_to, &reply).await.unwrap();
                }
            }
        });
    }

    fn client(broker: &MemoryBroker) -> RpcClient {
        RpcClient::new(ConnectionProvider::new(broker.connector()))
    }

    #[tokio::test]
    async fn should_resolve_matching_reply() {
        let broker = MemoryBroker::new();
        responder(&broker, "sum", |request| {
            let numbers: Vec<i64> = serde_json::from_slice(&request.payload).unwrap();
            let total = numbers.iter().sum::<i64>();
            let mut reply = Envelope::new(serde_json::to_vec(&Sum { total }).unwrap());
            reply.correlation_id = request.correlation_id.clone();
            reply
        })
        .await;

        let sum: Sum = client(&broker)
            .invoke(&Context::new(), &[1, 2, 3], "sum")
            .await
            .unwrap();

        assert_eq!(sum, Sum { total: 6 });
        assert_eq!(broker.queue_names(), vec!["sum".to_owned()]);
    }

    #[tokio::test]
    async fn should_fail_on_foreign_correlation_id() {
        let broker = MemoryBroker::new();
        responder(&broker, "sum", |_| {
            Envelope::new(r#"{"total":0}"#).correlation_id("someone-else")
        })
        .await;

        let result = client(&broker)
            .invoke::<_, Sum>(&Context::new(), &[1], "sum")
            .await;

        match result {
            Err(AmqpError::CorrelationMismatch { expected, received }) => {
                assert_ne!(expected, received);
                assert_eq!(received, "someone-else");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(broker.queue_names(), vec!["sum".to_owned()]);
    }

    #[tokio::test]
    async fn should_fail_on_reply_without_correlation_id() {
        let broker = MemoryBroker::new();
        responder(&broker, "sum", |_| Envelope::new(r#"{"total":0}"#)).await;

        let result = client(&broker)
            .invoke::<_, Sum>(&Context::new(), &[1], "sum")
            .await;

        assert!(matches!(
            result,
            Err(AmqpError::CorrelationMismatch { received, .. }) if received.is_empty()
        ));
    }

    #[tokio::test]
    async fn should_time_out_and_dispose_reply_queue() {
        let broker = MemoryBroker::new();

        let result = client(&broker)
            .invoke_with_deadline::<_, Sum>(
                &Context::new(),
                &[1],
                "nobody",
                Duration::from_millis(30),
            )
            .await;

        assert_eq!(result, Err(AmqpError::RpcTimeout(30)));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn should_surface_undecodable_reply() {
        let broker = MemoryBroker::new();
        responder(&broker, "sum", |request| {
            let mut reply = Envelope::new("not json");
            reply.correlation_id = request.correlation_id.clone();
            reply
        })
        .await;

        let result = client(&broker)
            .invoke::<_, Sum>(&Context::new(), &[1], "sum")
            .await;

        assert!(matches!(result, Err(AmqpError::ParsePayloadError(_))));
    }

    #[tokio::test]
    async fn should_report_closed_reply_stream_and_close_channel() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_declare_queue()
            .withf(|def| def.name().is_empty() && def.is_exclusive() && def.is_auto_delete())
            .returning(|_| Ok("amq.gen-reply".to_owned()));
        channel
            .expect_consume()
            .withf(|queue, _, auto_ack| queue.to_string() == "amq.gen-reply" && *auto_ack)
            .returning(|_, _, _| {
                let (_, rx) = mpsc::unbounded_channel();
                Ok(rx)
            });
        channel
            .expect_publish()
            .withf(|exchange, key, envelope| {
                exchange.to_string().is_empty()
                    && key.to_string() == "sum"
                    && envelope.reply_to.as_deref() == Some("amq.gen-reply")
                    && envelope.correlation_id.is_some()
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_close().times(1).returning(|| Ok(()));

        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let mut connection = MockAmqpConnection::new();
        connection
            .expect_create_channel()
            .returning(move || Ok(channel.clone()));
        let connection: Arc<dyn AmqpConnection> = Arc::new(connection);
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(move || Ok(connection.clone()));

        let result = RpcClient::new(ConnectionProvider::new(Arc::new(connector)))
            .invoke::<_, Sum>(&Context::new(), &[1], "sum")
            .await;

        assert_eq!(result, Err(AmqpError::ReplyChannelClosed));
    }
}
