// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Application and RabbitMQ settings. Values come from, in increasing priority:
//! defaults, an optional YAML/TOML/JSON file, and `PUBSUB__`-prefixed environment
//! variables such as `PUBSUB__RABBITMQ__HOST`.

use serde::Deserialize;
use tracing::error;

/// Prefix of the environment variables read by `Configs::load`
pub const CONFIG_ENV_PREFIX: &str = "PUBSUB";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    /// Used as the AMQP connection name.
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "peril".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Full connection URI; when set, the other fields are ignored.
    pub url: Option<String>,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            url: None,
        }
    }
}

impl RabbitMQConfigs {
    pub fn uri(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

impl Configs {
    /// Loads configuration from `path` (if given) and the environment.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|cfg| cfg.try_deserialize::<Configs>());

        if let Err(err) = &loaded {
            error!(error = err.to_string(), "failure to load configs");
        }

        loaded
    }
}
