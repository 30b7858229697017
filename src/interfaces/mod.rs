//! Interface definitions and the device's interface registry

pub mod model;
pub mod registry;

pub use model::{
    endpoint_matches, Aggregation, DatabaseRetentionPolicy, Interface, InterfaceLoadError,
    InterfaceType, Mapping, Ownership, Reliability, Retention,
};
pub use registry::{validate_interface, InterfaceRegistry};
