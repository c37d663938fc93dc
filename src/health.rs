// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Health Probe

use crate::{
    channel::{close_connection, connect_once, TlsMaterial},
    config::BrokerConfig,
    errors::AmqpError,
};
use lapin::{options::QueueDeclareOptions, types::FieldTable, Connection};
use std::time::Duration;
use tracing::{debug, warn};

/// Connect timeout of a single probe
pub const HEALTH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Reports whether the broker accepts a connection and a queue declaration.
///
/// Opens a short-lived connection, declares an anonymous exclusive
/// auto-delete queue and closes everything again. Never fails: every error
/// is logged and reported as `false`.
///
/// # Parameters
/// * `config` - Broker to check; its connect timeout is replaced by two seconds
///
/// # Returns
/// `true` when the connection and the declaration succeeded
pub async fn is_healthy(config: &BrokerConfig) -> bool {
    match probe(config).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                error = err.to_string(),
                host = config.host.as_str(),
                "broker health check failed"
            );
            false
        }
    }
}

async fn probe(config: &BrokerConfig) -> Result<(), AmqpError> {
    config.validate()?;
    let tls = TlsMaterial::load(config)?;

    let connection = connect_once(
        &config.uri(),
        tls.as_ref(),
        &config.connection_name,
        HEALTH_CONNECT_TIMEOUT,
    )
    .await
    .map_err(|err| AmqpError::ConnectionError {
        attempts: 1,
        reason: err.into_inner(),
    })?;

    let declared = declare_probe_queue(&connection).await;
    close_connection(&connection).await;
    declared
}

async fn declare_probe_queue(connection: &Connection) -> Result<(), AmqpError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

    let queue = channel
        .queue_declare(
            "",
            QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: true,
                auto_delete: true,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| AmqpError::DeclareQueueError("<anonymous>".to_owned(), err.to_string()))?;
    debug!(queue = queue.name().as_str(), "health probe queue declared");

    if let Err(err) = channel.close(200, "health check").await {
        debug!(error = err.to_string(), "error to close the health check channel");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_broker_is_unhealthy() {
        assert!(!is_healthy(&BrokerConfig::new("127.0.0.1", 1)).await);
    }

    #[tokio::test]
    async fn invalid_config_is_unhealthy() {
        assert!(!is_healthy(&BrokerConfig::new("", 5672)).await);
    }

    #[tokio::test]
    async fn missing_tls_material_is_unhealthy() {
        let mut config = BrokerConfig::new("127.0.0.1", 1);
        config.use_tls = true;
        config.ca_cert = Some("/nonexistent/ca_cert.pem".into());

        assert!(!is_healthy(&config).await);
    }
}
