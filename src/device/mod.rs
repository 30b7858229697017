//! The device: identity, interfaces, connection lifecycle and event fan-out
//!
//! A [`Device`] is a cheap handle over shared state; clones refer to the same
//! device. Connecting runs a handshake on a background task (see
//! [`Device::connect`]), incoming traffic and connectivity changes are
//! delivered to the installed handlers.

pub mod builder;
pub mod events;
mod incoming;
pub mod lifecycle;

pub use builder::DeviceBuilder;
pub use events::{
    AggregateMessage, AggregateMessageHandler, ConnectionStateHandler, ErrorHandler,
    IndividualMessage, IndividualMessageHandler,
};
pub use lifecycle::{
    broker_retry_decision, build_subscriptions, BrokerRetryDecision, ConnectResult,
    ConnectResultSender, ConnectionTimings,
};

use crate::error::{DeviceError, DeviceResult};
use crate::interfaces::{Interface, InterfaceRegistry};
use crate::pairing::{DeviceIdentity, PairingApi};
use crate::protocol::TopicBuilder;
use crate::transport::{Qos, Transport, TransportConnector, TrustAnchors};
use events::{DeviceEvent, EventFanout};
use lifecycle::InFlight;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Options that can change between connect attempts
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub auto_reconnect: bool,
    pub trust_anchors: Option<TrustAnchors>,
}

/// The transport handle together with the attempt that created it
#[derive(Clone)]
struct TransportSlot {
    transport: Arc<dyn Transport>,
    generation: u64,
}

pub(crate) struct DeviceInner {
    identity: DeviceIdentity,
    persistency_dir: PathBuf,
    base_topic: String,
    registry: RwLock<InterfaceRegistry>,
    options: RwLock<ConnectionOptions>,
    timings: ConnectionTimings,
    keep_alive: Duration,
    pairing: Arc<dyn PairingApi>,
    connector: Arc<dyn TransportConnector>,
    transport: RwLock<Option<TransportSlot>>,
    next_generation: AtomicU64,
    /// Generation whose handshake completed; 0 when none
    ready_generation: AtomicU64,
    reported_connected: AtomicBool,
    handshake: Mutex<Option<InFlight>>,
    /// Serialises the handshake body against disconnect
    lifecycle: tokio::sync::Mutex<()>,
    fanout: EventFanout,
}

/// A device connected (or connectable) to the broker
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("identity", &self.inner.identity)
            .field("persistency_dir", &self.inner.persistency_dir)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Device {
    /// Create a device talking to the pairing API at `pairing_url`
    ///
    /// Certificates are kept in a per-device directory below the system
    /// temporary directory.
    pub fn new(
        device_id: &str,
        realm: &str,
        credentials_secret: &str,
        pairing_url: &str,
    ) -> DeviceResult<Self> {
        Self::builder(device_id, realm, credentials_secret)
            .pairing_url(pairing_url)
            .build()
    }

    /// Create a device keeping its certificates in `persistency_dir`
    pub fn with_persistency(
        device_id: &str,
        realm: &str,
        credentials_secret: &str,
        pairing_url: &str,
        persistency_dir: impl Into<PathBuf>,
    ) -> DeviceResult<Self> {
        Self::builder(device_id, realm, credentials_secret)
            .pairing_url(pairing_url)
            .persistency_dir(persistency_dir)
            .build()
    }

    /// Start building a device with custom collaborators or timings
    pub fn builder(device_id: &str, realm: &str, credentials_secret: &str) -> DeviceBuilder {
        DeviceBuilder::new(device_id, realm, credentials_secret)
    }

    pub fn device_id(&self) -> &str {
        &self.inner.identity.device_id
    }

    pub fn realm(&self) -> &str {
        &self.inner.identity.realm
    }

    pub fn persistency_dir(&self) -> &Path {
        &self.inner.persistency_dir
    }

    /// Base topic `{realm}/{device_id}`
    pub fn base_topic(&self) -> &str {
        &self.inner.base_topic
    }

    /// Register an interface, replacing any interface with the same name
    ///
    /// Takes effect on the next connect.
    pub fn add_interface(&self, interface: Interface) -> DeviceResult<()> {
        let name = interface.name.clone();
        write(&self.inner.registry).add(interface)?;
        info!(device_id = %self.device_id(), interface = %name, "Interface registered");
        Ok(())
    }

    /// Unregister an interface; unknown names are ignored
    ///
    /// Existing subscriptions are kept until the next connect.
    pub fn remove_interface(&self, name: &str) {
        if write(&self.inner.registry).remove(name).is_some() {
            info!(device_id = %self.device_id(), interface = %name, "Interface removed");
        } else {
            debug!(device_id = %self.device_id(), interface = %name, "Interface not registered");
        }
    }

    /// Registered interfaces ordered by name
    pub fn interfaces(&self) -> Vec<Interface> {
        read(&self.inner.registry).snapshot()
    }

    pub fn interface(&self, name: &str) -> Option<Interface> {
        read(&self.inner.registry).get(name).cloned()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        write(&self.inner.options).auto_reconnect = enabled;
    }

    pub fn auto_reconnect(&self) -> bool {
        read(&self.inner.options).auto_reconnect
    }

    /// Trust only `anchors` for the broker instead of the bundled roots
    pub fn set_trust_anchors(&self, anchors: Option<TrustAnchors>) {
        write(&self.inner.options).trust_anchors = anchors;
    }

    pub fn on_individual_message(&self, handler: impl IndividualMessageHandler) {
        let handler: Arc<dyn IndividualMessageHandler> = Arc::new(handler);
        self.inner
            .fanout
            .update_handlers(|handlers| handlers.individual = Some(handler));
    }

    pub fn on_aggregate_message(&self, handler: impl AggregateMessageHandler) {
        let handler: Arc<dyn AggregateMessageHandler> = Arc::new(handler);
        self.inner
            .fanout
            .update_handlers(|handlers| handlers.aggregate = Some(handler));
    }

    pub fn on_error(&self, handler: impl ErrorHandler) {
        let handler: Arc<dyn ErrorHandler> = Arc::new(handler);
        self.inner
            .fanout
            .update_handlers(|handlers| handlers.error = Some(handler));
    }

    pub fn on_connection_state_changed(&self, handler: impl ConnectionStateHandler) {
        let handler: Arc<dyn ConnectionStateHandler> = Arc::new(handler);
        self.inner
            .fanout
            .update_handlers(|handlers| handlers.connection_state = Some(handler));
    }

    /// Whether the device is connected right now
    ///
    /// True only when a transport exists, reports a live connection, and its
    /// handshake completed.
    pub fn is_connected(&self) -> bool {
        match self.ready_transport() {
            Some(transport) => transport.is_connected(),
            None => false,
        }
    }

    /// Publish `payload` on `path` of a device-owned interface
    pub async fn send(&self, interface_name: &str, path: &str, payload: Vec<u8>) -> DeviceResult<()> {
        let qos = {
            let registry = read(&self.inner.registry);
            let interface = registry
                .get(interface_name)
                .ok_or_else(|| DeviceError::UnknownInterface(interface_name.to_string()))?;

            if !interface.is_device_owned() {
                return Err(DeviceError::NotDeviceOwned(interface_name.to_string()));
            }

            let mapping = interface
                .mapping_for_path(path)
                .ok_or_else(|| DeviceError::UnknownPath {
                    interface: interface_name.to_string(),
                    path: path.to_string(),
                })?;
            Qos::from(&mapping.reliability)
        };

        let transport = self.ready_transport().ok_or(DeviceError::NotConnected)?;
        if !transport.is_connected() {
            return Err(DeviceError::NotConnected);
        }

        let topic = TopicBuilder::interface_topic(&self.inner.base_topic, interface_name, path);
        debug!(device_id = %self.device_id(), topic = %topic, ?qos, "Sending");
        transport.publish(&topic, payload, qos).await?;
        Ok(())
    }

    /// Transport of the current handle if its handshake completed
    fn ready_transport(&self) -> Option<Arc<dyn Transport>> {
        let ready = self.inner.ready_generation.load(Ordering::SeqCst);
        read(&self.inner.transport)
            .as_ref()
            .filter(|slot| ready != 0 && slot.generation == ready)
            .map(|slot| slot.transport.clone())
    }

    fn emit(&self, event: DeviceEvent) {
        self.inner.fanout.emit(&self.inner, event);
    }

    /// Notify the connectivity handler on transitions only
    fn report_connectivity(&self, connected: bool) {
        if self.inner.reported_connected.swap(connected, Ordering::SeqCst) != connected {
            self.emit(DeviceEvent::ConnectionState(connected));
        }
    }
}
