// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Messaging Chassis
//!
//! Broker plumbing shared by the services of a microservice system: retried
//! and TLS-capable connections, idempotent topology declaration, JSON
//! publishing, per-queue listener threads with a handler registry, a
//! thread-to-async bridge, a health probe and log aggregation over the
//! broker.

mod otel;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod health;
pub mod log_layer;
pub mod logs;
pub mod message;
pub mod publisher;
pub mod retry;
pub mod topology;

pub use bridge::{MessageStream, Subscriber};
pub use channel::ConnectionManager;
pub use config::BrokerConfig;
pub use consumer::{MessageCallback, RabbitMQListener};
pub use dispatcher::{
    start_listener, HandlerRegistry, ListenerHandle, ListenerOptions, QueueHandler,
};
pub use errors::{AmqpError, HandlerError};
pub use exchange::ExchangeKind;
pub use health::is_healthy;
pub use message::MessageEnvelope;
pub use publisher::{PublishOptions, Publisher, RabbitMQPublisher};
pub use topology::TopologyDescriptor;
