// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The callback side of a subscription. A handler receives each delivery and
//! answers whether it was processed: `true` acknowledges the message, `false`
//! leaves it unacknowledged on the broker.

use crate::{
    broker::Delivery, codec::PayloadCodec, envelope::Envelope, errors::AmqpError,
    headers::Headers,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData};

/// A delivery as handed to a consumer handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery: Delivery,
}

impl ConsumerMessage {
    pub fn new(queue: &str, delivery: Delivery) -> ConsumerMessage {
        ConsumerMessage {
            queue: queue.to_owned(),
            delivery,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.delivery.envelope
    }

    pub fn payload(&self) -> &[u8] {
        &self.delivery.envelope.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.delivery.envelope.headers
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }
}

/// Processes consumed messages.
///
/// `Ok(true)` acknowledges the delivery and `Ok(false)` leaves it
/// unacknowledged. An `Err` counts as `false`, except `ParsePayloadError`
/// which is settled by the subscriber's decode failure policy.
#[cfg_attr(any(test, feature = "mocks"), mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<bool, AmqpError>;
}

/// Adapts a typed closure into a `ConsumerHandler`, decoding each payload
/// with `codec` before calling it.
pub struct FnHandler<C, T, F> {
    codec: C,
    func: F,
    _payload: PhantomData<fn() -> T>,
}

impl<C, T, F> FnHandler<C, T, F> {
    pub fn new<Fut>(codec: C, func: F) -> FnHandler<C, T, F>
    where
        F: Fn(T) -> Fut,
    {
        FnHandler {
            codec,
            func,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<C, T, F, Fut> ConsumerHandler for FnHandler<C, T, F>
where
    C: PayloadCodec,
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = bool> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<bool, AmqpError> {
        let value = self.codec.decode::<T>(msg.payload())?;
        Ok((self.func)(value).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Order {
        id: u32,
    }

    fn message(payload: &str) -> ConsumerMessage {
        ConsumerMessage::new(
            "orders",
            Delivery {
                delivery_tag: 3,
                exchange: String::new(),
                routing_key: "orders".to_owned(),
                redelivered: false,
                envelope: Envelope::new(payload),
            },
        )
    }

    #[tokio::test]
    async fn should_decode_payload_for_closure() {
        let handler = FnHandler::new(JsonCodec, |order: Order| async move { order.id == 7 });

        assert_eq!(
            handler.exec(&Context::new(), &message(r#"{"id":7}"#)).await,
            Ok(true)
        );
        assert_eq!(
            handler.exec(&Context::new(), &message(r#"{"id":8}"#)).await,
            Ok(false)
        );
    }

    #[tokio::test]
    async fn should_surface_undecodable_payload() {
        let handler = FnHandler::new(JsonCodec, |_: Order| async move { true });

        let result = handler.exec(&Context::new(), &message("not json")).await;

        assert!(matches!(result, Err(AmqpError::ParsePayloadError(_))));
    }

    #[test]
    fn should_expose_delivery_data() {
        let msg = message("hello");

        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.delivery_tag(), 3);
        assert!(msg.headers().is_empty());
    }
}
