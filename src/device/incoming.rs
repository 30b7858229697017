//! Routing of transport events into device events
//!
//! One router task runs per transport handle. Events from a handle that has
//! since been replaced are dropped.

use super::events::{AggregateMessage, DeviceEvent, IndividualMessage};
use super::{read, Device, DeviceInner};
use crate::error::{sanitize_error_message, DeviceError};
use crate::interfaces::{Aggregation, InterfaceRegistry};
use crate::protocol::{parse_incoming_topic, IncomingTopic, Introspection};
use crate::transport::{Qos, TransportEvent, TransportEventReceiver};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub(super) fn spawn_router(device: &Device, generation: u64, events: TransportEventReceiver) {
    let inner = Arc::downgrade(&device.inner);
    tokio::spawn(route_transport_events(inner, generation, events));
}

async fn route_transport_events(
    inner: Weak<DeviceInner>,
    generation: u64,
    mut events: TransportEventReceiver,
) {
    let mut handshake_connect_seen = false;
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let device = Device { inner };

        if !device.is_current_generation(generation) {
            debug!(generation, "Dropping event from replaced transport");
            continue;
        }

        match event {
            TransportEvent::Message { topic, payload } => {
                let event = {
                    let registry = read(&device.inner.registry);
                    classify_incoming(
                        &device.inner.base_topic,
                        &registry,
                        &topic,
                        payload,
                        Utc::now(),
                    )
                };
                if let Some(event) = event {
                    device.emit(event);
                }
            }
            TransportEvent::ConnectionLost(reason) => {
                device.handle_connection_lost(generation, reason)
            }
            // The first acknowledgement belongs to the handshake's own connect
            TransportEvent::Connected if !handshake_connect_seen => {
                handshake_connect_seen = true;
            }
            TransportEvent::Connected => device.handle_reconnected(generation).await,
        }
    }
    debug!(generation, "Transport event router stopped");
}

/// Turn an incoming publish into the event handlers should see (pure function)
///
/// Control messages yield `None`.
pub(crate) fn classify_incoming(
    base_topic: &str,
    registry: &InterfaceRegistry,
    topic: &str,
    payload: Bytes,
    received_at: DateTime<Utc>,
) -> Option<DeviceEvent> {
    let (interface_name, path) = match parse_incoming_topic(base_topic, topic) {
        Some(IncomingTopic::Control(control)) => {
            debug!(control = %control, bytes = payload.len(), "Ignoring control message");
            return None;
        }
        Some(IncomingTopic::Interface { interface, path }) => (interface, path),
        None => {
            return Some(DeviceEvent::Error(DeviceError::UnexpectedTopic(
                topic.to_string(),
            )))
        }
    };

    let Some(interface) = registry.get(&interface_name) else {
        return Some(DeviceEvent::Error(DeviceError::UnknownInterface(
            interface_name,
        )));
    };

    if !interface.is_server_owned() {
        return Some(DeviceEvent::Error(DeviceError::NotServerOwned(
            interface_name,
        )));
    }

    if interface.mapping_for_path(&path).is_none() {
        return Some(DeviceEvent::Error(DeviceError::UnknownPath {
            interface: interface_name,
            path,
        }));
    }

    let event = match interface.aggregation {
        Aggregation::Object => DeviceEvent::Aggregate(AggregateMessage {
            interface: interface_name,
            path,
            payload,
            received_at,
        }),
        _ => DeviceEvent::Individual(IndividualMessage {
            interface: interface_name,
            path,
            payload,
            received_at,
        }),
    };
    Some(event)
}

impl Device {
    fn is_current_generation(&self, generation: u64) -> bool {
        read(&self.inner.transport)
            .as_ref()
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    fn is_ready_generation(&self, generation: u64) -> bool {
        self.inner.ready_generation.load(Ordering::SeqCst) == generation
    }

    fn handle_connection_lost(&self, generation: u64, reason: String) {
        if !self.is_ready_generation(generation) {
            debug!(reason = %reason, "Connection lost during handshake");
            return;
        }

        warn!(
            device_id = %self.device_id(),
            reason = %sanitize_error_message(&reason),
            "Connection to broker lost"
        );
        self.emit(DeviceEvent::Error(DeviceError::ConnectionLost(reason)));
        self.report_connectivity(false);
    }

    /// The transport reconnected on its own; announce the interfaces again
    async fn handle_reconnected(&self, generation: u64) {
        if !self.is_ready_generation(generation)
            || self.inner.reported_connected.load(Ordering::SeqCst)
        {
            return;
        }

        let transport = read(&self.inner.transport)
            .as_ref()
            .map(|slot| slot.transport.clone());
        let Some(transport) = transport else {
            return;
        };

        info!(device_id = %self.device_id(), "Transport reconnected, sending introspection");
        let interfaces = read(&self.inner.registry).snapshot();
        let payload = Introspection::from_interfaces(&interfaces).payload();
        match transport
            .publish(&self.inner.base_topic, payload.into_bytes(), Qos::ExactlyOnce)
            .await
        {
            Ok(()) => self.report_connectivity(true),
            Err(e) => self.emit(DeviceEvent::Error(DeviceError::Transport(e))),
        }
    }
}
