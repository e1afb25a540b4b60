// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The unit exchanged with the broker: an opaque payload plus the routing
//! and RPC metadata attached to it.

use crate::{
    codec::PayloadCodec,
    errors::AmqpError,
    headers::{HeaderValue, Headers},
};
use serde::Serialize;

/// Default message and exchange expiry, in milliseconds
pub const DEFAULT_TTL_MILLIS: u32 = 30_000;

/// A message as it travels through the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// Present only on RPC requests and replies
    pub correlation_id: Option<String>,
    /// Present only on RPC requests
    pub reply_to: Option<String>,
    pub persistent: bool,
    /// MIME type of the payload, set from the codec that encoded it
    pub content_type: Option<String>,
    /// Message expiry. Publishers fall back to the binding TTL when unset.
    pub ttl_millis: Option<u32>,
}

impl Envelope {
    /// Creates a persistent envelope around an already encoded payload.
    ///
    /// # Parameters
    /// * `payload` - Encoded message body
    ///
    /// # Returns
    /// An envelope without headers, expiration or RPC metadata
    pub fn new(payload: impl Into<Vec<u8>>) -> Envelope {
        Envelope {
            payload: payload.into(),
            persistent: true,
            ..Envelope::default()
        }
    }

    /// Encodes `value` into a new persistent envelope.
    ///
    /// # Parameters
    /// * `codec` - Codec producing the payload, its content type is recorded
    /// * `value` - Value to encode
    ///
    /// # Returns
    /// The envelope, or `SerializationError` when the value cannot be encoded
    pub fn encode<C, T>(codec: &C, value: &T) -> Result<Envelope, AmqpError>
    where
        C: PayloadCodec,
        T: Serialize + ?Sized,
    {
        Ok(Envelope::new(codec.encode(value)?).content_type(codec.content_type()))
    }

    /// Adds or replaces a header.
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the expiration, overriding the TTL of the binding it is published on.
    ///
    /// # Parameters
    /// * `ttl_millis` - Expiration in milliseconds
    pub fn ttl(mut self, ttl_millis: u32) -> Self {
        self.ttl_millis = Some(ttl_millis);
        self
    }

    /// Keeps the message in memory only, as RPC replies are.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, JSON_CONTENT_TYPE};

    #[test]
    fn should_build_persistent_envelope_by_default() {
        let envelope = Envelope::new("hello");

        assert!(envelope.persistent);
        assert_eq!(envelope.payload, b"hello".to_vec());
        assert!(envelope.correlation_id.is_none());
        assert!(envelope.ttl_millis.is_none());
        assert!(envelope.content_type.is_none());
    }

    #[test]
    fn should_encode_value_with_codec() {
        let envelope = Envelope::encode(&JsonCodec, &vec![1, 2]).unwrap().ttl(500);

        assert_eq!(envelope.payload, b"[1,2]".to_vec());
        assert_eq!(envelope.content_type.as_deref(), Some(JSON_CONTENT_TYPE));
        assert_eq!(envelope.ttl_millis, Some(500));
    }
}
