//! Interface and mapping definitions
//!
//! Definitions are parsed leniently: an enumerated field holding a value this
//! crate does not recognise is kept as `Unknown(value)` so that the registry
//! can reject the whole interface with a precise validation error.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Declare a string-backed enumeration with an `Unknown` catch-all variant
macro_rules! interface_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $value:literal ),+ $(,)? }
        default $default:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A value outside the legal set, kept verbatim
            Unknown(String),
        }

        impl $name {
            /// Wire representation of this value
            pub fn as_str(&self) -> &str {
                match self {
                    $( Self::$variant => $value, )+
                    Self::Unknown(value) => value.as_str(),
                }
            }

            /// Whether this value is one of the legal values
            pub fn is_valid(&self) -> bool {
                !matches!(self, Self::Unknown(_))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $( $value => Self::$variant, )+
                    _ => Self::Unknown(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

interface_enum! {
    /// How the values of an interface are grouped
    Aggregation {
        /// Every mapping is sent and received independently
        Individual => "individual",
        /// All mappings under a common path travel together as one object
        Object => "object",
    }
    default Individual
}

interface_enum! {
    /// Kind of data an interface carries
    InterfaceType {
        /// Time series stream of values
        Datastream => "datastream",
        /// Persistent, stateful values
        Properties => "properties",
    }
    default Datastream
}

interface_enum! {
    /// Which side is allowed to publish on an interface
    Ownership {
        Device => "device",
        Server => "server",
    }
    default Device
}

interface_enum! {
    /// Delivery guarantee for a mapping
    Reliability {
        /// At most once
        Unreliable => "unreliable",
        /// At least once
        Guaranteed => "guaranteed",
        /// Exactly once
        Unique => "unique",
    }
    default Unreliable
}

interface_enum! {
    /// What happens to a message that cannot be delivered right away
    Retention {
        /// Dropped
        Discard => "discard",
        /// Kept in memory until delivered
        Volatile => "volatile",
        /// Persisted until delivered
        Stored => "stored",
    }
    default Discard
}

interface_enum! {
    /// Retention of stored values on the server database
    DatabaseRetentionPolicy {
        NoTtl => "no_ttl",
        UseTtl => "use_ttl",
    }
    default NoTtl
}

/// A named, versioned data-exchange contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(rename = "interface_name")]
    pub name: String,
    #[serde(rename = "version_major")]
    pub major_version: u32,
    #[serde(rename = "version_minor")]
    pub minor_version: u32,
    #[serde(rename = "type")]
    pub interface_type: InterfaceType,
    pub ownership: Ownership,
    #[serde(default)]
    pub aggregation: Aggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

/// One field of an interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Endpoint pattern, e.g. `/%{sensor_id}/value`
    pub endpoint: String,
    /// Declared value type (opaque to this crate)
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub reliability: Reliability,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_retention_policy: Option<DatabaseRetentionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_retention_ttl: Option<u64>,
    /// Seconds after which an undelivered message expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<u64>,
}

/// Errors raised while loading an interface definition
#[derive(Debug, Error)]
pub enum InterfaceLoadError {
    #[error("Failed to read interface file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse interface JSON: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Interface {
    /// Parse an interface from its JSON definition
    pub fn from_json(json: &str) -> Result<Self, InterfaceLoadError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load an interface from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, InterfaceLoadError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn is_server_owned(&self) -> bool {
        self.ownership == Ownership::Server
    }

    pub fn is_device_owned(&self) -> bool {
        self.ownership == Ownership::Device
    }

    /// Find the mapping that governs `path`
    ///
    /// For object aggregation `path` addresses the whole object, so it is
    /// matched against the parent of each endpoint.
    pub fn mapping_for_path(&self, path: &str) -> Option<&Mapping> {
        self.mappings.iter().find(|mapping| match self.aggregation {
            Aggregation::Object => endpoint_parent(&mapping.endpoint)
                .map(|parent| endpoint_matches(parent, path))
                .unwrap_or(false),
            _ => endpoint_matches(&mapping.endpoint, path),
        })
    }
}

/// Match a concrete path against an endpoint pattern
///
/// Segments of the form `%{name}` match exactly one non-empty path segment.
pub fn endpoint_matches(endpoint: &str, path: &str) -> bool {
    let pattern: Vec<&str> = endpoint.trim_start_matches('/').split('/').collect();
    let concrete: Vec<&str> = path.trim_start_matches('/').split('/').collect();

    if pattern.len() != concrete.len() {
        return false;
    }

    pattern
        .iter()
        .zip(concrete.iter())
        .all(|(expected, actual)| {
            if actual.is_empty() {
                false
            } else if expected.starts_with("%{") && expected.ends_with('}') {
                true
            } else {
                expected == actual
            }
        })
}

fn endpoint_parent(endpoint: &str) -> Option<&str> {
    let (parent, _) = endpoint.rsplit_once('/')?;
    if parent.is_empty() {
        None
    } else {
        Some(parent)
    }
}
