//! Topic construction and parsing for the device's MQTT namespace
//!
//! Every topic a device uses lives below its base topic `{realm}/{device_id}`.

/// Suffix of the control topic the broker uses to push the consumer
/// properties snapshot
pub const CONSUMER_PROPERTIES_SUFFIX: &str = "control/consumer/properties";

/// Topic construction functions
pub struct TopicBuilder;

impl TopicBuilder {
    /// Build the base topic: `{realm}/{device_id}`
    pub fn base_topic(realm: &str, device_id: &str) -> String {
        format!("{realm}/{device_id}")
    }

    /// Build the topic for a path of an interface: `{base}/{interface}{path}`
    pub fn interface_topic(base: &str, interface: &str, path: &str) -> String {
        if path.starts_with('/') {
            format!("{base}/{interface}{path}")
        } else {
            format!("{base}/{interface}/{path}")
        }
    }

    /// Build the wildcard filter covering every path of an interface: `{base}/{interface}/#`
    pub fn interface_filter(base: &str, interface: &str) -> String {
        format!("{base}/{interface}/#")
    }

    /// Build the consumer properties control topic: `{base}/control/consumer/properties`
    pub fn consumer_properties_topic(base: &str) -> String {
        format!("{base}/{CONSUMER_PROPERTIES_SUFFIX}")
    }
}

/// Classification of a topic received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingTopic {
    /// Control message; carries the part after `{base}/control/`
    Control(String),
    /// Data on an interface path; `path` always starts with `/`
    Interface { interface: String, path: String },
}

/// Split an incoming topic into control or interface data
///
/// Returns `None` when the topic is outside `base` or does not carry a path.
pub fn parse_incoming_topic(base: &str, topic: &str) -> Option<IncomingTopic> {
    let relative = topic.strip_prefix(base)?.strip_prefix('/')?;

    if let Some(control) = relative.strip_prefix("control/") {
        return Some(IncomingTopic::Control(control.to_string()));
    }

    let (interface, rest) = relative.split_once('/')?;
    if interface.is_empty() || rest.is_empty() {
        return None;
    }

    Some(IncomingTopic::Interface {
        interface: interface.to_string(),
        path: format!("/{rest}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "test/2TBn-jNESuuHamE2Zo1anA";

    #[test]
    fn test_topic_construction() {
        assert_eq!(
            TopicBuilder::base_topic("test", "2TBn-jNESuuHamE2Zo1anA"),
            BASE
        );
        assert_eq!(
            TopicBuilder::interface_topic(BASE, "org.example.Sensors", "/temp/value"),
            "test/2TBn-jNESuuHamE2Zo1anA/org.example.Sensors/temp/value"
        );
        assert_eq!(
            TopicBuilder::interface_topic(BASE, "org.example.Sensors", "temp/value"),
            "test/2TBn-jNESuuHamE2Zo1anA/org.example.Sensors/temp/value"
        );
        assert_eq!(
            TopicBuilder::interface_filter(BASE, "org.example.Commands"),
            "test/2TBn-jNESuuHamE2Zo1anA/org.example.Commands/#"
        );
        assert_eq!(
            TopicBuilder::consumer_properties_topic(BASE),
            "test/2TBn-jNESuuHamE2Zo1anA/control/consumer/properties"
        );
    }

    #[test]
    fn test_parse_interface_topic() {
        let parsed = parse_incoming_topic(
            BASE,
            "test/2TBn-jNESuuHamE2Zo1anA/org.example.Commands/led/1/state",
        );
        assert_eq!(
            parsed,
            Some(IncomingTopic::Interface {
                interface: "org.example.Commands".to_string(),
                path: "/led/1/state".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_control_topic() {
        let parsed = parse_incoming_topic(
            BASE,
            "test/2TBn-jNESuuHamE2Zo1anA/control/consumer/properties",
        );
        assert_eq!(
            parsed,
            Some(IncomingTopic::Control("consumer/properties".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        // Other device in the same realm
        assert_eq!(
            parse_incoming_topic(BASE, "test/AAAAAAAAAAAAAAAAAAAAAA/org.example.Commands/x"),
            None
        );
        // Base prefix without separator
        assert_eq!(
            parse_incoming_topic(BASE, "test/2TBn-jNESuuHamE2Zo1anAextra/iface/x"),
            None
        );
        // Interface without path
        assert_eq!(
            parse_incoming_topic(BASE, "test/2TBn-jNESuuHamE2Zo1anA/org.example.Commands"),
            None
        );
        assert_eq!(
            parse_incoming_topic(BASE, "test/2TBn-jNESuuHamE2Zo1anA/org.example.Commands/"),
            None
        );
        // The base topic itself carries the introspection, never data
        assert_eq!(parse_incoming_topic(BASE, BASE), None);
    }
}
