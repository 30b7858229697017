//! Name-keyed registry of interface definitions
//!
//! Insertion is validated field by field and is atomic: either the interface
//! is fully admitted or the registry is left untouched.

use crate::error::InterfaceValidationError;
use crate::interfaces::model::Interface;
use std::collections::HashMap;
use tracing::debug;

/// Validate every enumerated field of an interface (pure function)
///
/// Checks run in a fixed order (aggregation, type, ownership, then each
/// mapping's reliability, retention and database retention policy) and stop
/// at the first failure.
pub fn validate_interface(interface: &Interface) -> Result<(), InterfaceValidationError> {
    if !interface.aggregation.is_valid() {
        return Err(InterfaceValidationError::InvalidAggregation {
            interface: interface.name.clone(),
            value: interface.aggregation.to_string(),
        });
    }

    if !interface.interface_type.is_valid() {
        return Err(InterfaceValidationError::InvalidType {
            interface: interface.name.clone(),
            value: interface.interface_type.to_string(),
        });
    }

    if !interface.ownership.is_valid() {
        return Err(InterfaceValidationError::InvalidOwnership {
            interface: interface.name.clone(),
            value: interface.ownership.to_string(),
        });
    }

    for mapping in &interface.mappings {
        if !mapping.reliability.is_valid() {
            return Err(InterfaceValidationError::InvalidReliability {
                interface: interface.name.clone(),
                endpoint: mapping.endpoint.clone(),
                value: mapping.reliability.to_string(),
            });
        }

        if !mapping.retention.is_valid() {
            return Err(InterfaceValidationError::InvalidRetention {
                interface: interface.name.clone(),
                endpoint: mapping.endpoint.clone(),
                value: mapping.retention.to_string(),
            });
        }

        if let Some(policy) = &mapping.database_retention_policy {
            if !policy.is_valid() {
                return Err(InterfaceValidationError::InvalidDatabaseRetentionPolicy {
                    interface: interface.name.clone(),
                    endpoint: mapping.endpoint.clone(),
                    value: policy.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Interfaces known to a device, keyed by name
#[derive(Debug, Clone, Default)]
pub struct InterfaceRegistry {
    interfaces: HashMap<String, Interface>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert an interface, replacing any interface with the same name
    pub fn add(&mut self, interface: Interface) -> Result<(), InterfaceValidationError> {
        validate_interface(&interface)?;

        debug!(
            interface = %interface.name,
            major = interface.major_version,
            minor = interface.minor_version,
            "Registering interface"
        );
        self.interfaces.insert(interface.name.clone(), interface);
        Ok(())
    }

    /// Remove an interface by name, returning it if it was registered
    pub fn remove(&mut self, name: &str) -> Option<Interface> {
        self.interfaces.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.interfaces.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interfaces.is_empty()
    }

    /// Copy of every registered interface, ordered by name
    pub fn snapshot(&self) -> Vec<Interface> {
        let mut interfaces: Vec<Interface> = self.interfaces.values().cloned().collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        interfaces
    }

    /// Registered interface names, ordered
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.interfaces.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::model::{
        Aggregation, DatabaseRetentionPolicy, InterfaceType, Mapping, Ownership, Reliability,
        Retention,
    };

    fn mapping(endpoint: &str) -> Mapping {
        Mapping {
            endpoint: endpoint.to_string(),
            value_type: "double".to_string(),
            reliability: Reliability::Unreliable,
            retention: Retention::Discard,
            database_retention_policy: None,
            database_retention_ttl: None,
            expiry: None,
        }
    }

    fn interface(name: &str) -> Interface {
        Interface {
            name: name.to_string(),
            major_version: 1,
            minor_version: 0,
            interface_type: InterfaceType::Datastream,
            ownership: Ownership::Device,
            aggregation: Aggregation::Individual,
            description: None,
            mappings: vec![mapping("/%{id}/value")],
        }
    }

    #[test]
    fn test_validation_order_stops_at_first_failure() {
        let mut broken = interface("org.example.Broken");
        broken.aggregation = Aggregation::from("bundle");
        broken.interface_type = InterfaceType::from("stream");
        broken.ownership = Ownership::from("nobody");

        assert!(matches!(
            validate_interface(&broken),
            Err(InterfaceValidationError::InvalidAggregation { .. })
        ));

        broken.aggregation = Aggregation::Object;
        assert!(matches!(
            validate_interface(&broken),
            Err(InterfaceValidationError::InvalidType { .. })
        ));

        broken.interface_type = InterfaceType::Properties;
        assert!(matches!(
            validate_interface(&broken),
            Err(InterfaceValidationError::InvalidOwnership { .. })
        ));

        broken.ownership = Ownership::Server;
        assert!(validate_interface(&broken).is_ok());
    }

    #[test]
    fn test_mapping_fields_are_validated() {
        let mut bad_reliability = interface("org.example.A");
        bad_reliability.mappings[0].reliability = Reliability::from("maybe");
        bad_reliability.mappings[0].retention = Retention::from("forever");
        match validate_interface(&bad_reliability) {
            Err(InterfaceValidationError::InvalidReliability { endpoint, value, .. }) => {
                assert_eq!(endpoint, "/%{id}/value");
                assert_eq!(value, "maybe");
            }
            other => panic!("Expected InvalidReliability, got {other:?}"),
        }

        let mut bad_retention = interface("org.example.B");
        bad_retention.mappings[0].retention = Retention::from("forever");
        assert!(matches!(
            validate_interface(&bad_retention),
            Err(InterfaceValidationError::InvalidRetention { .. })
        ));

        let mut bad_policy = interface("org.example.C");
        bad_policy.mappings[0].database_retention_policy =
            Some(DatabaseRetentionPolicy::from("sometimes"));
        assert!(matches!(
            validate_interface(&bad_policy),
            Err(InterfaceValidationError::InvalidDatabaseRetentionPolicy { .. })
        ));

        let mut good_policy = interface("org.example.D");
        good_policy.mappings[0].database_retention_policy = Some(DatabaseRetentionPolicy::UseTtl);
        assert!(validate_interface(&good_policy).is_ok());
    }

    #[test]
    fn test_failed_add_leaves_registry_unchanged() {
        let mut registry = InterfaceRegistry::new();
        registry.add(interface("org.example.Sensors")).unwrap();

        let mut replacement = interface("org.example.Sensors");
        replacement.major_version = 2;
        replacement.mappings.push(mapping("/%{id}/name"));
        replacement.mappings[1].retention = Retention::from("forever");

        assert!(registry.add(replacement).is_err());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("org.example.Sensors").unwrap().major_version, 1);
    }

    #[test]
    fn test_last_write_wins() {
        let mut registry = InterfaceRegistry::new();
        registry.add(interface("org.example.Sensors")).unwrap();

        let mut newer = interface("org.example.Sensors");
        newer.major_version = 0;
        newer.minor_version = 7;
        registry.add(newer).unwrap();

        let stored = registry.get("org.example.Sensors").unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!((stored.major_version, stored.minor_version), (0, 7));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut registry = InterfaceRegistry::new();
        registry.add(interface("org.example.Sensors")).unwrap();

        assert!(registry.remove("org.example.Missing").is_none());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("org.example.Sensors").is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = InterfaceRegistry::new();
        registry.add(interface("org.example.Zeta")).unwrap();
        registry.add(interface("org.example.Alpha")).unwrap();
        registry.add(interface("org.example.Mid")).unwrap();

        let names: Vec<String> = registry.snapshot().into_iter().map(|i| i.name).collect();
        assert_eq!(
            names,
            vec!["org.example.Alpha", "org.example.Mid", "org.example.Zeta"]
        );
        assert_eq!(registry.names(), names);
    }
}
