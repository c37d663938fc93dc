// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Declaration
//!
//! A `TopologyDescriptor` names the queue a component works with and,
//! optionally, the exchange feeding it. Declaring it is idempotent on the
//! broker side: the queue is always durable, a named exchange is declared
//! durable with its kind and the queue is bound with the routing key. When
//! no exchange is named the broker's default exchange routes by queue name
//! and no binding is made.
//!
//! Declaring against an existing definition with different parameters makes
//! the broker close the channel with `PRECONDITION_FAILED`; that surfaces as
//! a fatal declaration error and is never retried.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Suffix appended to a queue name to form its dead-letter queue
pub const DLQ_SUFFIX: &str = ".dlq";

/// Queue, exchange and routing key a component publishes to or consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub(crate) queue: String,
    pub(crate) exchange: Option<String>,
    pub(crate) kind: ExchangeKind,
    pub(crate) routing_key: Option<String>,
    pub(crate) dead_letter: bool,
}

impl TopologyDescriptor {
    /// Creates a descriptor for `queue` on the default exchange.
    pub fn new(queue: &str) -> TopologyDescriptor {
        TopologyDescriptor {
            queue: queue.to_owned(),
            exchange: None,
            kind: ExchangeKind::Direct,
            routing_key: None,
            dead_letter: false,
        }
    }

    /// Routes through the named exchange of the given kind.
    pub fn exchange(mut self, name: &str, kind: ExchangeKind) -> Self {
        self.exchange = Some(name.to_owned());
        self.kind = kind;
        self
    }

    /// Sets the routing key used for binding and publishing.
    ///
    /// Defaults to the queue name.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Dead-letters rejected messages into `<queue>.dlq`.
    pub fn with_dlq(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// The exchange name, empty for the default exchange.
    pub fn exchange_name(&self) -> &str {
        self.exchange.as_deref().unwrap_or_default()
    }

    /// Exchange type; ignored on the default exchange.
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Whether messages go through the broker's default exchange.
    pub fn uses_default_exchange(&self) -> bool {
        self.exchange.is_none()
    }

    /// Routing key messages are published and bound with. On the default
    /// exchange this is always the queue name.
    pub fn effective_routing_key(&self) -> &str {
        match (&self.exchange, &self.routing_key) {
            (Some(_), Some(key)) => key,
            _ => &self.queue,
        }
    }

    /// Name of the dead-letter queue, `<queue>.dlq`, when enabled.
    pub fn dlq_name(&self) -> Option<String> {
        self.dead_letter.then(|| format!("{}{}", self.queue, DLQ_SUFFIX))
    }

    /// Rejects descriptors the broker could never accept.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "queue name must not be empty".to_owned(),
            ));
        }

        match (&self.exchange, &self.routing_key) {
            (Some(exchange), _) if exchange.trim().is_empty() => Err(AmqpError::InvalidTopology(
                "exchange name must not be empty, omit it to use the default exchange".to_owned(),
            )),
            (None, Some(key)) if key != &self.queue => Err(AmqpError::InvalidTopology(format!(
                "routing key `{}` must equal queue `{}` on the default exchange",
                key, self.queue
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn queue_arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(dlq) = self.dlq_name() {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq)),
            );
        }

        FieldTable::from(args)
    }
}

/// Broker-side declaration of a descriptor.
#[async_trait]
pub trait Topology {
    /// Declares the queue, its dead-letter queue, the exchange and the
    /// binding described by `descriptor`.
    async fn declare(&self, descriptor: &TopologyDescriptor) -> Result<(), AmqpError>;

    /// Binds the descriptor's queue to its exchange with an extra key.
    async fn bind(&self, descriptor: &TopologyDescriptor, routing_key: &str)
        -> Result<(), AmqpError>;
}

/// Declares topology over a lapin channel.
pub struct AmqpTopology {
    channel: Channel,
}

impl AmqpTopology {
    pub fn new(channel: Channel) -> AmqpTopology {
        AmqpTopology { channel }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare(&self, descriptor: &TopologyDescriptor) -> Result<(), AmqpError> {
        descriptor.validate()?;

        if let Some(dlq) = descriptor.dlq_name() {
            self.declare_queue(&dlq, FieldTable::default()).await?;
        }

        self.declare_queue(descriptor.queue_name(), descriptor.queue_arguments())
            .await?;

        if let Some(exchange) = &descriptor.exchange {
            self.declare_exchange(exchange, descriptor.kind).await?;
            self.bind_queue(
                descriptor.queue_name(),
                exchange,
                descriptor.effective_routing_key(),
            )
            .await?;
        }

        Ok(())
    }

    async fn bind(
        &self,
        descriptor: &TopologyDescriptor,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match &descriptor.exchange {
            Some(exchange) => {
                self.bind_queue(descriptor.queue_name(), exchange, routing_key)
                    .await
            }
            // the default exchange already routes by queue name
            None if routing_key == descriptor.queue_name() => Ok(()),
            None => Err(AmqpError::InvalidTopology(format!(
                "cannot bind `{}` on the default exchange",
                routing_key
            ))),
        }
    }
}

impl AmqpTopology {
    async fn declare_queue(&self, name: &str, args: FieldTable) -> Result<(), AmqpError> {
        debug!("declaring queue: {}", name);

        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                args,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned(), err.to_string()))
            }
            _ => {
                debug!("queue: {} was declared", name);
                Ok(())
            }
        }
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), AmqpError> {
        debug!("declaring {} exchange: {}", kind, name);

        match self
            .channel
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(name.to_owned(), err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, key: &str) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, key
        );

        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_string(table: &FieldTable, key: &str) -> Option<String> {
        match table.inner().get(key) {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            _ => None,
        }
    }

    #[test]
    fn default_exchange_routes_by_queue_name() {
        let desc = TopologyDescriptor::new("q1");
        assert!(desc.uses_default_exchange());
        assert_eq!(desc.exchange_name(), "");
        assert_eq!(desc.effective_routing_key(), "q1");
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn routing_key_defaults_to_queue_name_on_named_exchange() {
        let desc = TopologyDescriptor::new("orders").exchange("events", ExchangeKind::Topic);
        assert_eq!(desc.exchange_name(), "events");
        assert_eq!(desc.effective_routing_key(), "orders");

        let desc = desc.routing_key("order.*");
        assert_eq!(desc.effective_routing_key(), "order.*");
        assert_eq!(desc.kind(), ExchangeKind::Topic);
    }

    #[test]
    fn empty_queue_is_invalid() {
        assert!(matches!(
            TopologyDescriptor::new("  ").validate(),
            Err(AmqpError::InvalidTopology(_))
        ));
    }

    #[test]
    fn empty_exchange_name_is_invalid() {
        let desc = TopologyDescriptor::new("q").exchange("", ExchangeKind::Direct);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn default_exchange_rejects_foreign_routing_key() {
        let desc = TopologyDescriptor::new("q").routing_key("other");
        assert!(desc.validate().is_err());

        let desc = TopologyDescriptor::new("q").routing_key("q");
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn dead_letter_arguments_point_at_dlq() {
        let desc = TopologyDescriptor::new("payments").with_dlq();
        assert_eq!(desc.dlq_name().as_deref(), Some("payments.dlq"));

        let args = desc.queue_arguments();
        assert_eq!(
            long_string(&args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE).as_deref(),
            Some("")
        );
        assert_eq!(
            long_string(&args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).as_deref(),
            Some("payments.dlq")
        );
    }

    #[test]
    fn plain_queue_has_no_arguments() {
        let desc = TopologyDescriptor::new("plain");
        assert!(desc.dlq_name().is_none());
        assert!(desc.queue_arguments().inner().is_empty());
    }
}
