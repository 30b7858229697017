//! MQTT 3.1.1 transport over mutual TLS
//!
//! The module keeps pure logic apart from I/O:
//!
//! - [`connection`] - connection state, backoff policy, TLS and client options
//! - [`message_handler`] - routing of rumqttc events
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the event loop pump and the [`Transport`](crate::transport::Transport) implementation

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{MqttConnector, MqttTransport};
pub use connection::{ConnectionState, ReconnectConfig};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
