//! Device protocol conventions: identifiers, topics and introspection

pub mod device_id;
pub mod introspection;
pub mod topics;

pub use device_id::{is_valid_device_id, namespaced_device_id, random_device_id};
pub use introspection::{Introspection, IntrospectionEntry};
pub use topics::{parse_incoming_topic, IncomingTopic, TopicBuilder};
