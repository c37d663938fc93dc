// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Listener
//!
//! Runs the receive loop for one queue. Every delivery is decoded as JSON,
//! handed to the callback and then settled exactly once:
//! - callback succeeded: ack
//! - decode or callback failure: nack without requeue, so a queue declared
//!   with a dead-letter queue moves the message there instead of looping
//! - the receiving side is gone (`HandlerError::Shutdown`): nack with requeue,
//!   the message was never processed, and the loop stops
//!
//! Per-message failures never stop the loop. It ends when the shutdown token
//! is cancelled, the broker cancels the consumer or the channel fails.

use crate::{
    channel::ConnectionManager,
    config::BrokerConfig,
    errors::{AmqpError, HandlerError},
    message::MessageEnvelope,
    otel,
    topology::TopologyDescriptor,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions},
    protocol::basic::AMQPProperties,
    types::FieldTable,
    Channel,
};
use opentelemetry::trace::{Span, Status};
use serde_json::Value;
use std::borrow::Cow;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives each decoded message with the name of the queue it came from.
pub trait MessageCallback: Send + Sync {
    fn call(&self, message: Value, queue: &str) -> Result<(), HandlerError>;
}

impl<F> MessageCallback for F
where
    F: Fn(Value, &str) -> Result<(), HandlerError> + Send + Sync,
{
    fn call(&self, message: Value, queue: &str) -> Result<(), HandlerError> {
        self(message, queue)
    }
}

/// Settles a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.0.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }
}

/// A delivery detached from lapin.
pub(crate) struct Inbound {
    pub(crate) properties: AMQPProperties,
    pub(crate) data: Vec<u8>,
    pub(crate) delivery_tag: u64,
    pub(crate) acker: Box<dyn Acknowledger>,
}

impl From<Delivery> for Inbound {
    fn from(delivery: Delivery) -> Self {
        Inbound {
            properties: delivery.properties,
            data: delivery.data,
            delivery_tag: delivery.delivery_tag,
            acker: Box::new(LapinAcker(delivery.acker)),
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    Rejected,
    /// Broker acked on delivery, nothing left to settle
    AutoAcked,
    /// Handed back unprocessed
    Returned,
}

/// Listener for the queue of one descriptor.
pub struct RabbitMQListener {
    manager: ConnectionManager,
    descriptor: TopologyDescriptor,
    consumer_tag: String,
}

impl RabbitMQListener {
    /// Creates a listener for the descriptor's queue.
    ///
    /// # Parameters
    /// * `config` - Broker to consume from
    /// * `descriptor` - Queue, exchange and binding declared on open
    ///
    /// # Returns
    /// A closed listener; call `open()` before `consume()`
    pub fn new(config: BrokerConfig, descriptor: TopologyDescriptor) -> Self {
        RabbitMQListener::with_manager(ConnectionManager::new(config), descriptor)
    }

    /// Uses `manager` for the connection; it declares `descriptor` on open.
    pub fn with_manager(manager: ConnectionManager, descriptor: TopologyDescriptor) -> Self {
        RabbitMQListener {
            manager: manager.with_topology(descriptor.clone()),
            consumer_tag: format!("{}-{}", descriptor.queue_name(), Uuid::new_v4()),
            descriptor,
        }
    }

    /// Connects, applies QoS and declares the topology.
    pub async fn open(&mut self) -> Result<Channel, AmqpError> {
        self.manager.open().await
    }

    /// The open channel, `None` before `open()` or after `close()`.
    pub fn channel(&self) -> Option<&Channel> {
        self.manager.channel()
    }

    /// Name of the queue this listener consumes.
    pub fn queue(&self) -> &str {
        self.descriptor.queue_name()
    }

    /// Topology the listener declares on open.
    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    /// Closes the channel and connection. Safe to call more than once.
    pub async fn close(&mut self) {
        self.manager.close().await;
    }

    /// Consumes the queue until `shutdown` is cancelled or the broker ends
    /// the consumer.
    ///
    /// With `auto_ack` the broker considers messages settled on delivery and
    /// no ack or nack is sent.
    ///
    /// # Parameters
    /// * `callback` - Receives every decoded message with the queue name
    /// * `auto_ack` - Let the broker settle messages on delivery
    /// * `shutdown` - Stops the loop before the next delivery once cancelled
    ///
    /// # Returns
    /// `Ok(())` when stopped or cancelled by the broker, `NotConnected`
    /// before `open()`, or the consumer error that ended the loop
    pub async fn consume(
        &self,
        callback: &dyn MessageCallback,
        auto_ack: bool,
        shutdown: &CancellationToken,
    ) -> Result<(), AmqpError> {
        let channel = self.manager.channel().cloned().ok_or(AmqpError::NotConnected)?;
        let queue = self.descriptor.queue_name();

        let consumer = match channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(queue, "started consuming");

        let deliveries = consumer.map(|result| {
            result
                .map(Inbound::from)
                .map_err(|err| AmqpError::ConsumerError(err.to_string()))
        });
        let result = drive(queue, deliveries, callback, auto_ack, shutdown).await;

        if channel.status().connected() {
            if let Err(err) = channel
                .basic_cancel(&self.consumer_tag, BasicCancelOptions { nowait: false })
                .await
            {
                warn!(error = err.to_string(), "error to cancel the consumer");
            }
        }

        info!(queue, "stopped consuming");
        result
    }
}

/// The receive loop, one delivery at a time in broker order.
pub(crate) async fn drive<S>(
    queue: &str,
    mut deliveries: S,
    callback: &dyn MessageCallback,
    auto_ack: bool,
    shutdown: &CancellationToken,
) -> Result<(), AmqpError>
where
    S: Stream<Item = Result<Inbound, AmqpError>> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                debug!(queue, "stop requested");
                return Ok(());
            }

            next = deliveries.next() => match next {
                None => {
                    warn!(queue, "consumer was cancelled by the broker");
                    return Ok(());
                }
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue, "consumer stream failed");
                    return Err(err);
                }
                Some(Ok(inbound)) => {
                    let (_ctx, mut span) = otel::consumer_span(&inbound.properties, queue);

                    match handle_delivery(queue, &inbound, callback, auto_ack).await {
                        Ok(Outcome::Returned) => {
                            span.set_status(Status::Error {
                                description: Cow::from("handoff closed, message returned"),
                            });
                            return Ok(());
                        }
                        Ok(Outcome::Rejected) => span.set_status(Status::Error {
                            description: Cow::from("message rejected"),
                        }),
                        Ok(_) => span.set_status(Status::Ok),
                        Err(err) => {
                            error!(error = err.to_string(), queue, "error settling msg");
                            span.record_error(&err);
                            span.set_status(Status::Error {
                                description: Cow::from("error settling msg"),
                            });
                        }
                    }
                }
            }
        }
    }
}

/// Decodes, dispatches and settles one delivery.
pub(crate) async fn handle_delivery(
    queue: &str,
    inbound: &Inbound,
    callback: &dyn MessageCallback,
    auto_ack: bool,
) -> Result<Outcome, AmqpError> {
    let content_type = inbound
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str());

    let processed = match MessageEnvelope::decode(content_type, &inbound.data, inbound.delivery_tag)
    {
        Ok(envelope) => callback.call(envelope.into_payload(), queue),
        Err(err) => {
            error!(error = err.to_string(), queue, "rejecting undecodable message");
            Err(HandlerError::failed(err))
        }
    };

    match processed {
        Ok(()) if auto_ack => Ok(Outcome::AutoAcked),
        Ok(()) => {
            debug!(queue, "message successfully processed");
            inbound.acker.ack().await?;
            Ok(Outcome::Acked)
        }
        Err(HandlerError::Shutdown) => {
            warn!(queue, "handoff closed, returning message to the queue");
            if !auto_ack {
                inbound.acker.nack(true).await?;
            }
            Ok(Outcome::Returned)
        }
        Err(err) => {
            error!(error = err.to_string(), queue, "failed to process message");
            if auto_ack {
                return Ok(Outcome::AutoAcked);
            }
            inbound.acker.nack(false).await?;
            Ok(Outcome::Rejected)
        }
    }
}
