// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Session Layer
//!
//! This module provides the error type shared by channel sessions, the publication
//! pipeline and the subscription pipeline. Structural and ack/nack failures are always
//! returned to the immediate caller; transient channel faults are retried by the
//! publisher before they surface.

use thiserror::Error;

/// Represents errors that can occur while publishing, consuming or managing sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Transient broker or channel fault
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// A structural operation was attempted on a cancelled session
    #[error("session `{0}` has been cancelled")]
    SessionCancelled(String),

    /// The channel that delivered a message is no longer part of its session
    #[error("the channel has been closed, unable to {0} message")]
    ChannelClosed(&'static str),

    /// A channel was opened with a consumer tag that is still registered
    #[error("consumer tag `{0}` is already registered")]
    DuplicateConsumerTag(String),

    /// Error cancelling a consumer on the broker
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// The broker negatively confirmed a published message
    #[error("message `{0}` was nacked by the broker")]
    PublishNacked(String),

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Bad key, IV or algorithm in an encryption profile
    #[error("{0}")]
    EncryptionError(String),

    /// A received message could not be decrypted
    #[error("failure to decrypt message `{0}`")]
    DecryptionError(String),

    /// Publication name not present in the configuration
    #[error("Unknown publication: {0}")]
    UnknownPublication(String),

    /// Subscription name not present in the configuration
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the publisher may retry the operation that produced this error.
    ///
    /// Only connection and channel faults qualify; encoding, encryption and
    /// configuration errors are deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError | AmqpError::ChannelError(_) | AmqpError::PublishingError
        )
    }
}
