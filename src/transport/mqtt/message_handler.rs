//! Pure message routing for MQTT events
//!
//! This module contains pure functions for classifying rumqttc events and
//! mapping between the transport's QoS and rumqttc's.

use crate::transport::Qos;
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, QoS, SubscribeReasonCode};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(Self::subscribe_return_code)
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Wire value of a SubAck return code (pure function)
    pub fn subscribe_return_code(code: &SubscribeReasonCode) -> u8 {
        match code {
            SubscribeReasonCode::Success(qos) => *qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        }
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(return_codes: &[u8]) -> Result<(), String> {
        if return_codes.iter().any(|&code| code >= 0x80) {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }

    /// Map the transport QoS onto rumqttc (pure function)
    pub fn to_mqtt_qos(qos: Qos) -> QoS {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// MQTT broker disconnected
    Disconnected,
    /// Our DISCONNECT packet went out
    DisconnectSent,
    /// Subscription confirmed with return codes
    SubscriptionConfirmed { packet_id: u16, return_codes: Vec<u8> },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, SubAck};

    #[test]
    fn test_route_mqtt_event() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        ));

        let disconnect = Event::Incoming(Packet::Disconnect);
        assert!(matches!(
            MessageHandler::route_mqtt_event(&disconnect),
            EventRoute::Disconnected
        ));

        let sent = Event::Outgoing(Outgoing::Disconnect);
        assert!(matches!(
            MessageHandler::route_mqtt_event(&sent),
            EventRoute::DisconnectSent
        ));

        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "test/2TBn-jNESuuHamE2Zo1anA/org.example.Commands/led",
            QoS::ExactlyOnce,
            "on",
        )));
        match MessageHandler::route_mqtt_event(&publish) {
            EventRoute::MessageReceived { topic, payload } => {
                assert_eq!(topic, "test/2TBn-jNESuuHamE2Zo1anA/org.example.Commands/led");
                assert_eq!(payload, Bytes::from_static(b"on"));
            }
            other => panic!("Expected MessageReceived route, got {other:?}"),
        }

        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::PingResp)),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_suback_routing() {
        let suback = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(QoS::ExactlyOnce),
                SubscribeReasonCode::Failure,
            ],
        )));

        match MessageHandler::route_mqtt_event(&suback) {
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                assert_eq!(packet_id, 7);
                assert_eq!(return_codes, vec![0x02, 0x80]);
            }
            other => panic!("Expected SubscriptionConfirmed route, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_subscription_success() {
        assert!(MessageHandler::validate_subscription_success(&[0x00, 0x01, 0x02]).is_ok());
        assert!(MessageHandler::validate_subscription_success(&[0x80]).is_err());
        assert!(MessageHandler::validate_subscription_success(&[0x02, 0x80]).is_err());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(MessageHandler::to_mqtt_qos(Qos::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(MessageHandler::to_mqtt_qos(Qos::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(MessageHandler::to_mqtt_qos(Qos::ExactlyOnce), QoS::ExactlyOnce);
    }
}
