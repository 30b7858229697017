//! Introspection descriptor
//!
//! After connecting, the device announces which interfaces it supports, and
//! at which version, by publishing `name:major:minor` entries joined by `;`
//! on its base topic.

use crate::interfaces::{Interface, InterfaceType, Ownership};
use std::fmt;

/// One announced interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectionEntry {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub ownership: Ownership,
    pub interface_type: InterfaceType,
}

/// Descriptor of every interface a device supports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Introspection {
    entries: Vec<IntrospectionEntry>,
}

impl Introspection {
    /// Build the descriptor from a registry snapshot; entries are ordered by name
    pub fn from_interfaces(interfaces: &[Interface]) -> Self {
        let mut entries: Vec<IntrospectionEntry> = interfaces
            .iter()
            .map(|interface| IntrospectionEntry {
                name: interface.name.clone(),
                major: interface.major_version,
                minor: interface.minor_version,
                ownership: interface.ownership.clone(),
                interface_type: interface.interface_type.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Self { entries }
    }

    pub fn entries(&self) -> &[IntrospectionEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wire payload: `name:major:minor;name:major:minor`
    pub fn payload(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Introspection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}:{}:{}", entry.name, entry.major, entry.minor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::Aggregation;

    fn interface(name: &str, major: u32, minor: u32, ownership: Ownership) -> Interface {
        Interface {
            name: name.to_string(),
            major_version: major,
            minor_version: minor,
            interface_type: InterfaceType::Datastream,
            ownership,
            aggregation: Aggregation::Individual,
            description: None,
            mappings: Vec::new(),
        }
    }

    #[test]
    fn test_payload_format() {
        let introspection = Introspection::from_interfaces(&[
            interface("org.example.Sensors", 1, 2, Ownership::Device),
            interface("org.example.Commands", 0, 1, Ownership::Server),
        ]);

        assert_eq!(
            introspection.payload(),
            "org.example.Commands:0:1;org.example.Sensors:1:2"
        );
        assert_eq!(introspection.entries()[0].ownership, Ownership::Server);
    }

    #[test]
    fn test_single_and_empty() {
        let single =
            Introspection::from_interfaces(&[interface("org.example.Only", 3, 0, Ownership::Device)]);
        assert_eq!(single.payload(), "org.example.Only:3:0");

        let empty = Introspection::from_interfaces(&[]);
        assert!(empty.is_empty());
        assert_eq!(empty.payload(), "");
    }
}
