// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! This module provides the error taxonomy shared by every component of the
//! crate. The `AmqpError` enum represents connection, declaration, publishing,
//! delivery and RPC failures. Broker library errors are logged where they
//! happen and then mapped into the variant naming the operation that failed.

use thiserror::Error;

/// Represents errors that can occur while talking to the broker.
///
/// Each variant names the operation that failed and carries the broker or
/// codec message that explains why.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Broker unreachable or authentication rejected
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// A value could not be encoded into a payload
    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    /// An inbound payload could not be decoded into the expected shape
    #[error("failure to parse payload `{0}`")]
    ParsePayloadError(String),

    /// A consumer or RPC handler reported a failure
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// An RPC reply arrived carrying another call's correlation id
    #[error("correlation mismatch: expected `{expected}` received `{received}`")]
    CorrelationMismatch { expected: String, received: String },

    /// No RPC reply arrived before the deadline, in milliseconds
    #[error("rpc call timed out after {0}ms")]
    RpcTimeout(u128),

    /// The reply stream ended before any reply arrived
    #[error("reply channel closed before a reply arrived")]
    ReplyChannelClosed,

    /// Application code tried to set a header reserved for the header matcher
    #[error("header `{0}` is reserved")]
    ReservedHeader(String),

    /// A binding descriptor is missing data its exchange kind requires
    #[error("invalid binding `{0}`")]
    InvalidBinding(String),

    /// Configuration could not be loaded
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}
