//! Astarte device - Rust Implementation
//!
//! A device-side connectivity client for Astarte-style MQTT brokers.
//!
//! # Overview
//!
//! This crate connects a device to its broker and keeps it there:
//! - Device identifier validation and generation
//! - Interface definitions and a validating interface registry
//! - Pairing API client for broker discovery and client certificates
//! - MQTT transport over mutual TLS
//! - Connection lifecycle handshake with subscriptions and introspection
//! - Typed handlers for incoming data, errors and connectivity changes
//!
//! # Quick Start
//!
//! ```rust
//! use astarte_device::protocol::{is_valid_device_id, Introspection};
//! use astarte_device::interfaces::{Interface, InterfaceRegistry};
//!
//! assert!(is_valid_device_id("2TBn-jNESuuHamE2Zo1anA"));
//!
//! let interface = Interface::from_json(r#"{
//!     "interface_name": "org.example.Sensors",
//!     "version_major": 1,
//!     "version_minor": 2,
//!     "type": "datastream",
//!     "ownership": "device",
//!     "mappings": [{"endpoint": "/temperature", "type": "double"}]
//! }"#).unwrap();
//!
//! let mut registry = InterfaceRegistry::new();
//! registry.add(interface).unwrap();
//!
//! let introspection = Introspection::from_interfaces(&registry.snapshot());
//! assert_eq!(introspection.payload(), "org.example.Sensors:1:2");
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod interfaces;
pub mod observability;
pub mod pairing;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, DeviceConfig};
pub use device::{
    AggregateMessage, ConnectionTimings, Device, DeviceBuilder, IndividualMessage,
};
pub use error::{ConnectError, DeviceError, DeviceResult, InterfaceValidationError};
pub use interfaces::{Interface, InterfaceRegistry};
pub use pairing::{DeviceIdentity, PairingApi, PairingClient};
pub use protocol::{is_valid_device_id, namespaced_device_id, random_device_id};
pub use transport::mqtt::MqttConnector;
pub use transport::{Transport, TransportConnector, TrustAnchors};
