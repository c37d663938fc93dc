// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Log Aggregation
//!
//! Services ship their log records to the `logs.exchange` topic exchange
//! with routing keys of the form `<service>.<level>`. The aggregator consumes
//! them from `logs.aggregator` and hands each valid record to a [`LogSink`].
//!
//! Records with missing required fields or an unreadable timestamp are
//! logged and dropped; they would never become valid on redelivery. A sink
//! failure is a handler failure and leads to a nack.

use crate::{
    dispatcher::{HandlerRegistry, QueueHandler, SyncHandler},
    errors::{AmqpError, HandlerError},
    exchange::ExchangeKind,
    topology::TopologyDescriptor,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Topic exchange log records are published to
pub const LOG_EXCHANGE: &str = "logs.exchange";
/// Queue the aggregator consumes
pub const LOG_QUEUE: &str = "logs.aggregator";
/// Binding that matches every `<service>.<level>` key
pub const LOG_ROUTING_KEY: &str = "*.#";

/// A validated log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: String,
    pub message: String,
    pub module: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
    pub client_id: Option<i64>,
    pub order_id: Option<i64>,
}

/// Why a record was dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogRecordError {
    #[error("log record is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid timestamp format: {0}")]
    InvalidTimestamp(String),

    #[error("field `{0}` is not an integer")]
    NotAnInteger(&'static str),
}

impl LogEntry {
    /// Validates a received record.
    pub fn from_record(record: &Value) -> Result<LogEntry, LogRecordError> {
        let fields = record.as_object().ok_or(LogRecordError::NotAnObject)?;

        let required = |name: &'static str| -> Result<String, LogRecordError> {
            match fields.get(name) {
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                Some(Value::Null) | None => Err(LogRecordError::MissingField(name)),
                Some(Value::String(_)) => Err(LogRecordError::MissingField(name)),
                Some(other) => Ok(other.to_string()),
            }
        };

        let timestamp = parse_timestamp(&required("timestamp")?)?;
        let service = required("service")?;
        let level = required("level")?.to_uppercase();
        let message = required("message")?;

        Ok(LogEntry {
            timestamp,
            service,
            level,
            message,
            module: optional_text(fields.get("module")),
            function: optional_text(fields.get("function")),
            line: optional_int(fields.get("line"), "line")?
                .map(|line| u32::try_from(line).map_err(|_| LogRecordError::NotAnInteger("line")))
                .transpose()?,
            client_id: optional_int(fields.get("client_id"), "client_id")?,
            order_id: optional_int(fields.get("order_id"), "order_id")?,
        })
    }
}

/// Accepts RFC 3339 or a naive ISO-8601 timestamp, which is taken as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, LogRecordError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|_| LogRecordError::InvalidTimestamp(raw.to_owned()))
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn optional_int(value: Option<&Value>, name: &'static str) -> Result<Option<i64>, LogRecordError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_i64().map(Some).ok_or(LogRecordError::NotAnInteger(name)),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| LogRecordError::NotAnInteger(name)),
        Some(_) => Err(LogRecordError::NotAnInteger(name)),
    }
}

/// Storage for aggregated log records.
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn store(&self, entry: LogEntry) -> Result<(), HandlerError>;
}

/// Synchronous handler that validates records and stores them.
pub struct LogIngestion {
    sink: Arc<dyn LogSink>,
}

impl LogIngestion {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        LogIngestion { sink }
    }
}

impl SyncHandler for LogIngestion {
    fn handle(&self, message: &Value) -> Result<(), HandlerError> {
        let entry = match LogEntry::from_record(message) {
            Ok(entry) => entry,
            Err(err) => {
                error!(error = err.to_string(), "dropping invalid log record");
                return Ok(());
            }
        };

        debug!(
            service = entry.service.as_str(),
            level = entry.level.as_str(),
            "log stored"
        );
        self.sink.store(entry)
    }
}

/// Descriptor of the aggregator queue and its binding.
pub fn log_topology() -> TopologyDescriptor {
    TopologyDescriptor::new(LOG_QUEUE)
        .exchange(LOG_EXCHANGE, ExchangeKind::Topic)
        .routing_key(LOG_ROUTING_KEY)
}

/// Registers the log aggregator for `logs.aggregator`.
pub fn register_log_ingestion(
    registry: &HandlerRegistry,
    sink: Arc<dyn LogSink>,
) -> Result<(), AmqpError> {
    registry.register(log_topology(), QueueHandler::sync(LogIngestion::new(sink)))
}
