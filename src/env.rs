use std::env;

use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;

use crate::config::{ConnectionConfig, DrainConfig};
use crate::rabbitmq::Topology;

impl DrainConfig {
    /// Build the configuration from the process environment (and `.env`).
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup. Recognised keys:
    /// `AMQP_ADDR` (required), `EXCHANGE_NAME`, `QUEUE_NAME`,
    /// `AMQP_AUTO_RECONNECT`, `AMQP_DISPLAY_ERRORS`, `AMQP_SILENT`,
    /// `AMQP_RECONNECT_DELAY_MS`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = lookup("AMQP_ADDR").ok_or_else(|| anyhow!("AMQP_ADDR is not set"))?;
        let mut connection = ConnectionConfig::new(&endpoint);

        if let Some(val) = lookup("AMQP_AUTO_RECONNECT") {
            connection.auto_reconnect = parse_flag("AMQP_AUTO_RECONNECT", &val)?;
        }
        if let Some(val) = lookup("AMQP_DISPLAY_ERRORS") {
            connection.display_errors = parse_flag("AMQP_DISPLAY_ERRORS", &val)?;
        }
        if let Some(val) = lookup("AMQP_SILENT") {
            connection.silent = parse_flag("AMQP_SILENT", &val)?;
        }
        if let Some(val) = lookup("AMQP_RECONNECT_DELAY_MS") {
            connection.reconnect_delay_ms = val
                .parse()
                .context("AMQP_RECONNECT_DELAY_MS must be a number of milliseconds")?;
        }
        connection.validate()?;

        let topology = Topology::new(
            &lookup("EXCHANGE_NAME").unwrap_or_default(),
            &lookup("QUEUE_NAME").unwrap_or_default(),
        );
        topology.validate()?;

        Ok(DrainConfig {
            connection,
            topology,
        })
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} has invalid boolean value '{}'", key, other)),
    }
}
