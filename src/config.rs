// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! `BrokerConfig` carries everything needed to reach the broker: address,
//! credentials, TLS material paths, the default queue and the QoS prefetch
//! ceiling. It is plain data; a `ConnectionManager` takes its own copy so the
//! settings cannot change under an open connection.
//!
//! Values are layered with the `config` crate: built-in defaults, then an
//! optional TOML file, then `RABBITMQ_*` environment variables.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Environment variable pointing at an optional TOML configuration file
pub const CONFIG_PATH_ENV: &str = "RABBITMQ_CONFIG_PATH";
/// Prefix of the environment variables overriding configuration values
pub const ENV_PREFIX: &str = "RABBITMQ";

/// Default location of the CA certificate used to verify the broker
pub const DEFAULT_CA_CERT_PATH: &str = "/etc/rabbitmq/ssl/ca_cert.pem";
/// Default location of the client certificate presented for mutual TLS
pub const DEFAULT_CLIENT_CERT_PATH: &str = "/etc/rabbitmq/ssl/client_cert.pem";
/// Default location of the client private key presented for mutual TLS
pub const DEFAULT_CLIENT_KEY_PATH: &str = "/etc/rabbitmq/ssl/client_key.pem";

/// Connection settings for a single broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Queue used when a component is not given one explicitly
    pub queue: String,
    pub use_tls: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    /// Fail instead of falling back to server-only TLS when the client
    /// certificate or key is missing
    pub require_client_auth: bool,
    /// Maximum number of unacknowledged deliveries per consumer
    pub prefetch_count: u16,
    pub heartbeat_secs: u16,
    pub connect_timeout_secs: u64,
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            queue: String::new(),
            use_tls: false,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            require_client_auth: false,
            prefetch_count: 10,
            heartbeat_secs: 600,
            connect_timeout_secs: 10,
            connection_name: "rabbitmq-chassis".to_owned(),
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration for the given broker address with default
    /// credentials and settings.
    pub fn new(host: &str, port: u16) -> Self {
        BrokerConfig {
            host: host.to_owned(),
            port,
            ..BrokerConfig::default()
        }
    }

    /// Loads the configuration from defaults, the optional file named by
    /// `RABBITMQ_CONFIG_PATH` and `RABBITMQ_*` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }

        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Parses a TOML document; missing keys take their default values.
    pub fn from_toml(raw: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Sets the credentials.
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_owned();
        self.password = password.to_owned();
        self
    }

    /// Sets the default queue.
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_owned();
        self
    }

    /// Sets the QoS prefetch count.
    pub fn prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch_count = prefetch;
        self
    }

    /// Enables TLS and points the CA, client certificate and client key at
    /// the standard deployment paths under `/etc/rabbitmq/ssl`.
    pub fn with_default_tls_paths(mut self) -> Self {
        self.use_tls = true;
        self.ca_cert = Some(PathBuf::from(DEFAULT_CA_CERT_PATH));
        self.client_cert = Some(PathBuf::from(DEFAULT_CLIENT_CERT_PATH));
        self.client_key = Some(PathBuf::from(DEFAULT_CLIENT_KEY_PATH));
        self
    }

    /// Checks the values that cannot be caught by deserialization.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.host.trim().is_empty() {
            return Err(AmqpError::ConfigError("host must not be empty".to_owned()));
        }

        if self.prefetch_count == 0 {
            return Err(AmqpError::ConfigError(
                "prefetch_count must be a positive integer".to_owned(),
            ));
        }

        Ok(())
    }

    /// Per-attempt connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Builds the AMQP URI, `amqps` when TLS is enabled.
    pub(crate) fn uri(&self) -> String {
        let scheme = if self.use_tls { "amqps" } else { "amqp" };

        format!(
            "{}://{}:{}@{}:{}/{}?heartbeat={}",
            scheme,
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs,
        )
    }

    /// URI safe for logs.
    pub(crate) fn redacted_uri(&self) -> String {
        let scheme = if self.use_tls { "amqps" } else { "amqp" };
        format!("{}://{}:***@{}:{}", scheme, self.username, self.host, self.port)
    }
}
