//! Event fan-out to caller-supplied handlers
//!
//! Events are queued on an unbounded channel and delivered, in emission
//! order, by a single dispatcher task. Handlers therefore never run while a
//! device lock is held and may call back into the device.

use super::{lock, read, write, Device, DeviceInner};
use crate::error::DeviceError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A value received on an individually aggregated interface
#[derive(Debug, Clone, PartialEq)]
pub struct IndividualMessage {
    pub interface: String,
    pub path: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// An object received on an object aggregated interface
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateMessage {
    pub interface: String,
    pub path: String,
    pub payload: Bytes,
    pub received_at: DateTime<Utc>,
}

/// Receives values on individually aggregated interfaces
pub trait IndividualMessageHandler: Send + Sync + 'static {
    fn on_individual_message(&self, device: &Device, message: IndividualMessage);
}

/// Receives objects on object aggregated interfaces
pub trait AggregateMessageHandler: Send + Sync + 'static {
    fn on_aggregate_message(&self, device: &Device, message: AggregateMessage);
}

/// Receives errors raised outside of any caller request
pub trait ErrorHandler: Send + Sync + 'static {
    fn on_error(&self, device: &Device, error: DeviceError);
}

/// Receives connectivity transitions
pub trait ConnectionStateHandler: Send + Sync + 'static {
    fn on_connection_state_changed(&self, device: &Device, connected: bool);
}

impl<F> IndividualMessageHandler for F
where
    F: Fn(&Device, IndividualMessage) + Send + Sync + 'static,
{
    fn on_individual_message(&self, device: &Device, message: IndividualMessage) {
        self(device, message)
    }
}

impl<F> AggregateMessageHandler for F
where
    F: Fn(&Device, AggregateMessage) + Send + Sync + 'static,
{
    fn on_aggregate_message(&self, device: &Device, message: AggregateMessage) {
        self(device, message)
    }
}

impl<F> ErrorHandler for F
where
    F: Fn(&Device, DeviceError) + Send + Sync + 'static,
{
    fn on_error(&self, device: &Device, error: DeviceError) {
        self(device, error)
    }
}

impl<F> ConnectionStateHandler for F
where
    F: Fn(&Device, bool) + Send + Sync + 'static,
{
    fn on_connection_state_changed(&self, device: &Device, connected: bool) {
        self(device, connected)
    }
}

/// Currently installed handlers
#[derive(Default, Clone)]
pub(crate) struct EventHandlers {
    pub individual: Option<Arc<dyn IndividualMessageHandler>>,
    pub aggregate: Option<Arc<dyn AggregateMessageHandler>>,
    pub error: Option<Arc<dyn ErrorHandler>>,
    pub connection_state: Option<Arc<dyn ConnectionStateHandler>>,
}

/// Something a handler should hear about
#[derive(Debug)]
pub(crate) enum DeviceEvent {
    Individual(IndividualMessage),
    Aggregate(AggregateMessage),
    Error(DeviceError),
    ConnectionState(bool),
}

/// Queue feeding the dispatcher task
pub(crate) struct EventFanout {
    handlers: RwLock<EventHandlers>,
    tx: mpsc::UnboundedSender<DeviceEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
}

impl EventFanout {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handlers: RwLock::new(EventHandlers::default()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub(crate) fn update_handlers(&self, update: impl FnOnce(&mut EventHandlers)) {
        update(&mut write(&self.handlers));
    }

    fn handlers(&self) -> EventHandlers {
        read(&self.handlers).clone()
    }

    /// Queue an event, starting the dispatcher on first use
    pub(crate) fn emit(&self, inner: &Arc<DeviceInner>, event: DeviceEvent) {
        self.ensure_dispatcher(inner);
        if self.tx.send(event).is_err() {
            debug!("Event dispatcher stopped, dropping event");
        }
    }

    fn ensure_dispatcher(&self, inner: &Arc<DeviceInner>) {
        let mut slot = lock(&self.rx);
        if slot.is_none() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                if let Some(rx) = slot.take() {
                    runtime.spawn(run_dispatcher(Arc::downgrade(inner), rx));
                }
            }
            Err(_) => warn!("No tokio runtime, events stay queued until one is available"),
        }
    }
}

/// Deliver queued events until the device is dropped
async fn run_dispatcher(device: Weak<DeviceInner>, mut rx: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = device.upgrade() else {
            break;
        };
        let device = Device { inner };
        let handlers = device.inner.fanout.handlers();
        dispatch(&device, &handlers, event);
    }
    debug!("Event dispatcher stopped");
}

fn dispatch(device: &Device, handlers: &EventHandlers, event: DeviceEvent) {
    match event {
        DeviceEvent::Individual(message) => match &handlers.individual {
            Some(handler) => handler.on_individual_message(device, message),
            None => debug!(interface = %message.interface, "No individual message handler"),
        },
        DeviceEvent::Aggregate(message) => match &handlers.aggregate {
            Some(handler) => handler.on_aggregate_message(device, message),
            None => debug!(interface = %message.interface, "No aggregate message handler"),
        },
        DeviceEvent::Error(error) => match &handlers.error {
            Some(handler) => handler.on_error(device, error),
            None => warn!(error = %error.sanitized_message(), "Unhandled device error"),
        },
        DeviceEvent::ConnectionState(connected) => {
            if let Some(handler) = &handlers.connection_state {
                handler.on_connection_state_changed(device, connected);
            }
        }
    }
}
