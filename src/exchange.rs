// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Kinds
//!
//! The routing behaviours a named exchange can be declared with:
//! - Direct: exact routing key match
//! - Topic: wildcard pattern match on dot-separated routing keys
//! - Fanout: every bound queue, routing key ignored

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    /// Exchange type as the broker names it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            "fanout" => Ok(ExchangeKind::Fanout),
            other => Err(AmqpError::InvalidTopology(format!(
                "unsupported exchange kind `{}`",
                other
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_kinds_case_insensitively() {
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!("Fanout".parse::<ExchangeKind>(), Ok(ExchangeKind::Fanout));
        assert_eq!(" DIRECT ".parse::<ExchangeKind>(), Ok(ExchangeKind::Direct));
    }

    #[test]
    fn rejects_headers_exchanges() {
        assert!(matches!(
            "headers".parse::<ExchangeKind>(),
            Err(AmqpError::InvalidTopology(_))
        ));
    }

    #[test]
    fn maps_to_lapin_kinds() {
        assert!(matches!(
            lapin::ExchangeKind::from(ExchangeKind::Topic),
            lapin::ExchangeKind::Topic
        ));
        assert_eq!(ExchangeKind::default().to_string(), "direct");
    }
}
