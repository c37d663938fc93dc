// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! Bodies travel as UTF-8 JSON tagged with `application/json`. The payload
//! must be a JSON object or array. On the receive path the envelope also
//! carries the broker's delivery tag.

use crate::errors::AmqpError;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// The only content type produced and accepted
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Lost when the broker restarts
    Transient = 1,
    /// Written to disk by the broker
    #[default]
    Persistent = 2,
}

impl DeliveryMode {
    /// `Persistent` for `true`, `Transient` otherwise.
    pub fn from_persistent(persistent: bool) -> Self {
        if persistent {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A JSON payload with its delivery attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEnvelope {
    payload: Value,
    delivery_mode: DeliveryMode,
    delivery_tag: Option<u64>,
}

impl MessageEnvelope {
    /// Wraps a JSON object or array as a persistent message.
    pub fn new(payload: Value) -> Result<Self, AmqpError> {
        check_structured(&payload)?;

        Ok(MessageEnvelope {
            payload,
            delivery_mode: DeliveryMode::Persistent,
            delivery_tag: None,
        })
    }

    /// Serializes any value that maps onto a JSON object or array.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, AmqpError> {
        let payload = serde_json::to_value(value)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;
        MessageEnvelope::new(payload)
    }

    /// Overrides the default persistent delivery mode.
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Decodes a delivered body, rejecting any content type but JSON.
    pub fn decode(
        content_type: Option<&str>,
        body: &[u8],
        delivery_tag: u64,
    ) -> Result<Self, AmqpError> {
        match content_type {
            Some(JSON_CONTENT_TYPE) => {}
            Some(other) => return Err(AmqpError::UnexpectedContentType(other.to_owned())),
            None => return Err(AmqpError::UnexpectedContentType("<unset>".to_owned())),
        }

        let text =
            std::str::from_utf8(body).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        let payload: Value =
            serde_json::from_str(text).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))?;
        check_structured(&payload)?;

        Ok(MessageEnvelope {
            payload,
            delivery_mode: DeliveryMode::Persistent,
            delivery_tag: Some(delivery_tag),
        })
    }

    /// Serializes the payload for the message body.
    ///
    /// # Returns
    /// The JSON bytes, or `SerializePayloadError` when serialization fails
    pub fn encode(&self) -> Result<Vec<u8>, AmqpError> {
        serde_json::to_vec(&self.payload)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))
    }

    /// AMQP properties for publishing: content type, delivery mode, a fresh
    /// message id and the given headers.
    pub fn properties(&self, headers: BTreeMap<ShortString, AMQPValue>) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(self.delivery_mode.as_u8())
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers))
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn into_payload(self) -> Value {
        self.payload
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Delivery tag of a received message; `None` for outgoing ones.
    pub fn delivery_tag(&self) -> Option<u64> {
        self.delivery_tag
    }
}

fn check_structured(payload: &Value) -> Result<(), AmqpError> {
    if payload.is_object() || payload.is_array() {
        Ok(())
    } else {
        Err(AmqpError::InvalidPayload(
            "payload must be a JSON object or array".to_owned(),
        ))
    }
}
