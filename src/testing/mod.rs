//! Testing utilities and mock implementations
//!
//! Mock pairing and transport collaborators for exercising the device without
//! a pairing API or MQTT broker.

pub mod mocks;

pub use mocks::*;
