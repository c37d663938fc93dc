// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Serializes JSON payloads and emits them with the JSON content type, the
//! requested delivery mode and the caller's trace context in the headers.
//!
//! Publishing is fire-and-forget: no publisher confirm is awaited, so a
//! successful return means the broker accepted the frame, not that the
//! message was stored. When the channel is gone at call time the publisher
//! makes exactly one reconnect attempt before failing.

use crate::{
    channel::ConnectionManager,
    config::BrokerConfig,
    errors::AmqpError,
    message::{DeliveryMode, MessageEnvelope},
    otel,
    retry::FixedRetry,
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Per-message publishing overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Defaults to the descriptor's routing key
    pub routing_key: Option<String>,
    /// Defaults to the descriptor's exchange
    pub exchange: Option<String>,
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        PublishOptions {
            routing_key: None,
            exchange: None,
            persistent: true,
        }
    }
}

impl PublishOptions {
    /// Overrides the descriptor's routing key.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Overrides the descriptor's exchange; `""` is the default exchange.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = Some(exchange.to_owned());
        self
    }

    /// Marks the message as not surviving a broker restart.
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message`, propagating the trace context of `ctx`.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `message` - JSON object or array to send
    /// * `options` - Routing overrides and delivery mode
    ///
    /// # Returns
    /// `Ok(())` once the broker accepted the frame, `InvalidPayload` for a
    /// scalar message, `ReconnectError` when the single reconnect fails or
    /// `PublishingError` when the broker rejects the publish
    async fn publish(
        &self,
        ctx: &Context,
        message: &Value,
        options: &PublishOptions,
    ) -> Result<(), AmqpError>;
}

/// Publisher bound to one descriptor's exchange and routing key.
pub struct RabbitMQPublisher {
    manager: Mutex<ConnectionManager>,
    descriptor: TopologyDescriptor,
}

impl RabbitMQPublisher {
    /// Creates a publisher; the connection is opened by `connect()` or by the
    /// first publish.
    ///
    /// # Parameters
    /// * `config` - Broker to publish to
    /// * `descriptor` - Exchange, queue and routing key declared on connect
    ///
    /// # Returns
    /// A shared publisher that is not connected yet
    pub fn new(config: BrokerConfig, descriptor: TopologyDescriptor) -> Arc<RabbitMQPublisher> {
        RabbitMQPublisher::with_manager(ConnectionManager::new(config), descriptor)
    }

    /// Creates a publisher on a prepared manager, e.g. one with its own
    /// retry policy.
    ///
    /// The descriptor replaces any topology already set on `manager`, so the
    /// exchange and queue are declared whenever the publisher (re)connects.
    ///
    /// # Parameters
    /// * `manager` - Closed connection manager to publish through
    /// * `descriptor` - Exchange, queue and routing key declared on connect
    ///
    /// # Returns
    /// A shared publisher that is not connected yet
    pub fn with_manager(
        manager: ConnectionManager,
        descriptor: TopologyDescriptor,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            manager: Mutex::new(manager.with_topology(descriptor.clone())),
            descriptor,
        })
    }

    /// Opens the connection under the manager's full retry policy.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.manager.lock().await.open().await.map(|_| ())
    }

    /// Publishes with default options and the current trace context.
    pub async fn send(&self, message: &Value) -> Result<(), AmqpError> {
        self.publish(&Context::current(), message, &PublishOptions::default())
            .await
    }

    /// Closes the channel and connection. A later publish reconnects once.
    pub async fn close(&self) {
        self.manager.lock().await.close().await;
    }

    /// Descriptor whose exchange and routing key are used by default.
    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        message: &Value,
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        let envelope = MessageEnvelope::new(message.clone())?
            .with_delivery_mode(DeliveryMode::from_persistent(options.persistent));
        let body = envelope.encode()?;

        let channel = {
            let mut manager = self.manager.lock().await;
            let existing = manager.channel().cloned();
            match existing {
                Some(channel) => channel,
                None => {
                    warn!("channel is not open, reconnecting once before publishing");
                    manager
                        .open_with(&FixedRetry::once())
                        .await
                        .map_err(|err| AmqpError::ReconnectError(err.to_string()))?
                }
            }
        };

        let (exchange, routing_key) = resolve_target(&self.descriptor, options);
        debug!(
            exchange = exchange.as_str(),
            routing_key = routing_key.as_str(),
            "publishing message"
        );

        match channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &body,
                envelope.properties(otel::inject(ctx)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Exchange and routing key for a publish, falling back to the descriptor.
fn resolve_target(descriptor: &TopologyDescriptor, options: &PublishOptions) -> (String, String) {
    let exchange = options
        .exchange
        .clone()
        .unwrap_or_else(|| descriptor.exchange_name().to_owned());
    let routing_key = options
        .routing_key
        .clone()
        .unwrap_or_else(|| descriptor.effective_routing_key().to_owned());

    (exchange, routing_key)
}
