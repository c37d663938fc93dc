// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Chassis
//!
//! `AmqpError` covers everything the broker-facing components can fail with:
//! connectivity, TLS material, topology declaration, publishing, decoding and
//! acknowledgment. Connectivity and topology variants are fatal for the owning
//! component; decode and handler failures stay local to a single delivery.
//!
//! `HandlerError` is what application handlers return. The listener turns it
//! into a negative acknowledgment and keeps serving the queue, except for
//! `HandlerError::Shutdown`, which stops it.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid broker configuration
    #[error("invalid broker configuration: {0}")]
    ConfigError(String),

    /// The broker stayed unreachable for the whole retry budget
    #[error("could not connect to the broker after {attempts} attempt(s): {reason}")]
    ConnectionError { attempts: u32, reason: String },

    /// TLS material is missing, unreadable or malformed
    #[error("invalid tls material: {0}")]
    TlsError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Operation requires an open channel
    #[error("not connected, open the connection first")]
    NotConnected,

    /// The single reconnect attempt made on publish failed
    #[error("could not reconnect to the broker: {0}")]
    ReconnectError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// A topology descriptor that can never be declared
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Payload is not a JSON object or array
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Error serializing a payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Delivery carried a content type other than JSON
    #[error("unexpected content type `{0}`")]
    UnexpectedContentType(String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error while consuming messages
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// No handler registered for the queue
    #[error("no handler registered for queue `{0}`")]
    HandlerNotRegistered(String),

    /// Registration attempted after listeners started
    #[error("handler registry is sealed, cannot register `{0}`")]
    RegistrySealed(String),

    /// Listener thread could not be started or panicked
    #[error("listener thread failure: {0}")]
    ListenerThreadError(String),
}

/// Errors returned by application message handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler could not process the message
    #[error("handler failure: {0}")]
    Failed(String),

    /// Dispatch found no handler for the queue
    #[error("no handler registered for queue `{0}`")]
    NotRegistered(String),

    /// The scheduler needed to run a suspending handler was unavailable
    #[error("scheduler failure: {0}")]
    Scheduler(String),

    /// The receiving side of the bridge handoff is gone and the delivery was
    /// not processed.
    ///
    /// Reserved for the bridge between the listener thread and a
    /// `MessageStream`. The listener nacks the delivery with requeue and
    /// stops consuming, so a handler returning it silently ends its own
    /// listener. Handlers report their failures with `Failed`.
    #[error("message handoff is closed")]
    Shutdown,
}

impl HandlerError {
    /// Wraps any displayable error as a handler failure.
    pub fn failed(err: impl ToString) -> Self {
        HandlerError::Failed(err.to_string())
    }
}
