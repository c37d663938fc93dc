// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Shipping
//!
//! [`BrokerLogLayer`] is a `tracing_subscriber` layer that turns application
//! events into log records for the aggregator. Events are queued without
//! blocking and a [`LogForwarder`] task publishes them to `logs.exchange`
//! with the routing key `<service>.<level>`.
//!
//! Events from this crate and from `lapin` are never shipped, so publishing
//! a record cannot produce another one.

use crate::{
    logs::LOG_EXCHANGE,
    publisher::{PublishOptions, Publisher},
};
use chrono::Utc;
use opentelemetry::Context;
use serde_json::{json, Value};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{
    field::{Field, Visit},
    warn, Event, Level, Subscriber,
};
use tracing_subscriber::{layer::Context as LayerContext, Layer};

const SKIPPED_TARGETS: [&str; 2] = ["rabbitmq_chassis", "lapin"];

/// A record waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct ShippedLog {
    pub routing_key: String,
    pub record: Value,
}

/// Ships events at or above a level to the log exchange.
pub struct BrokerLogLayer {
    service: String,
    max_level: Level,
    sender: UnboundedSender<ShippedLog>,
}

/// Creates the layer for `service` and the forwarder that publishes its
/// records through `publisher`. The forwarder must be spawned.
pub fn broker_log_layer(
    service: &str,
    publisher: Arc<dyn Publisher>,
) -> (BrokerLogLayer, LogForwarder) {
    let (sender, receiver) = mpsc::unbounded_channel();

    (
        BrokerLogLayer {
            service: service.to_owned(),
            max_level: Level::INFO,
            sender,
        },
        LogForwarder {
            receiver,
            publisher,
        },
    )
}

impl BrokerLogLayer {
    /// Ships events up to `level` in verbosity; the default is `INFO`.
    pub fn with_max_level(mut self, level: Level) -> Self {
        self.max_level = level;
        self
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: Option<String>,
    client_id: Option<Value>,
    order_id: Option<Value>,
}

impl RecordVisitor {
    fn record_value(&mut self, field: &Field, value: Value) {
        match field.name() {
            "message" => {
                self.message = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
            }
            "client_id" => self.client_id = Some(value),
            "order_id" => self.order_id = Some(value),
            _ => {}
        }
    }
}

impl Visit for RecordVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_value(field, json!(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_value(field, json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_value(field, json!(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.record_value(field, json!(format!("{:?}", value)));
    }
}

impl<S> Layer<S> for BrokerLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.max_level {
            return;
        }

        let target = metadata.target();
        if SKIPPED_TARGETS.iter().any(|skipped| target.starts_with(skipped)) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let level = metadata.level().as_str();
        let record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "service": self.service,
            "level": level,
            "message": visitor.message.unwrap_or_else(|| metadata.name().to_owned()),
            "module": target,
            "function": Value::Null,
            "line": metadata.line(),
            "client_id": visitor.client_id,
            "order_id": visitor.order_id,
        });

        // the forwarder is gone, nothing left to ship to
        let _ = self.sender.send(ShippedLog {
            routing_key: format!("{}.{}", self.service, level.to_lowercase()),
            record,
        });
    }
}

/// Publishes queued records until every layer feeding it is dropped.
pub struct LogForwarder {
    receiver: UnboundedReceiver<ShippedLog>,
    publisher: Arc<dyn Publisher>,
}

impl LogForwarder {
    /// Runs until the layer is dropped. Publish failures are logged and skipped.
    pub async fn run(mut self) {
        while let Some(log) = self.receiver.recv().await {
            let options = PublishOptions::default()
                .exchange(LOG_EXCHANGE)
                .routing_key(&log.routing_key)
                .transient();

            if let Err(err) = self
                .publisher
                .publish(&Context::new(), &log.record, &options)
                .await
            {
                warn!(
                    error = err.to_string(),
                    routing_key = log.routing_key.as_str(),
                    "failure to ship log record"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::AmqpError, logs::LogEntry, publisher::MockPublisher};
    use std::sync::Mutex;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(publisher: MockPublisher, emit: impl FnOnce()) -> LogForwarder {
        let (layer, forwarder) = broker_log_layer("orders", Arc::new(publisher));
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);
        forwarder
    }

    #[tokio::test]
    async fn events_are_published_with_service_routing_key() {
        let published = Arc::new(Mutex::new(vec![]));
        let sink = published.clone();

        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .withf(|_, _, opts| opts.exchange.as_deref() == Some(LOG_EXCHANGE) && !opts.persistent)
            .times(2)
            .returning(move |_, record, opts| {
                sink.lock()
                    .unwrap()
                    .push((opts.routing_key.clone(), record.clone()));
                Ok(())
            });

        let forwarder = capture(publisher, || {
            tracing::info!(target: "orders::api", client_id = 7, "order placed");
            tracing::error!(target: "orders::stock", order_id = 9001u64, "out of stock");
        });
        forwarder.run().await;

        let published = published.lock().unwrap();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0.as_deref(), Some("orders.info"));
        assert_eq!(published[1].0.as_deref(), Some("orders.error"));

        let entry = LogEntry::from_record(&published[0].1).unwrap();
        assert_eq!(entry.service, "orders");
        assert_eq!(entry.level, "INFO");
        assert_eq!(entry.message, "order placed");
        assert_eq!(entry.module.as_deref(), Some("orders::api"));
        assert_eq!(entry.client_id, Some(7));
        assert_eq!(
            LogEntry::from_record(&published[1].1).unwrap().order_id,
            Some(9001)
        );
    }

    #[tokio::test]
    async fn own_and_verbose_events_are_not_shipped() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().never();

        let forwarder = capture(publisher, || {
            tracing::debug!(target: "orders::api", "too verbose");
            tracing::warn!(target: "rabbitmq_chassis::consumer", "internal");
            tracing::warn!(target: "lapin::channel", "internal");
        });
        forwarder.run().await;
    }

    #[tokio::test]
    async fn publish_failures_do_not_stop_the_forwarder() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .times(2)
            .returning(|_, _, _| Err(AmqpError::PublishingError("broker gone".to_owned())));

        let forwarder = capture(publisher, || {
            tracing::warn!(target: "orders", "first");
            tracing::warn!(target: "orders", "second");
        });
        forwarder.run().await;
    }
}
