//! Resilient AMQP queue drain: keeps a connection and channel alive across
//! failures and forwards JSON messages from a fan-out bound queue to
//! application subscribers.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{ConnectionConfig, DrainConfig};
