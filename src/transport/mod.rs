//! Transport layer for device communication
//!
//! The connection lifecycle only talks to a broker through the
//! [`TransportConnector`] and [`Transport`] traits; the MQTT implementation in
//! [`mqtt`] is the default, and tests inject mocks.

use crate::interfaces::Reliability;
use crate::pairing::ClientCertificate;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use url::Url;

pub mod mqtt;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<&Reliability> for Qos {
    fn from(reliability: &Reliability) -> Self {
        match reliability {
            Reliability::Guaranteed => Qos::AtLeastOnce,
            Reliability::Unique => Qos::ExactlyOnce,
            Reliability::Unreliable | Reliability::Unknown(_) => Qos::AtMostOnce,
        }
    }
}

/// A topic filter to subscribe to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub qos: Qos,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Custom certificate authorities used instead of the bundled roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAnchors {
    pem: String,
}

impl TrustAnchors {
    pub fn from_pem(pem: impl Into<String>) -> Self {
        Self { pem: pem.into() }
    }

    pub fn from_pem_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::from_pem(std::fs::read_to_string(path)?))
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

/// Everything a transport needs to reach the broker
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub broker_url: Url,
    pub client_id: String,
    pub certificate: ClientCertificate,
    pub trust_anchors: Option<TrustAnchors>,
    pub auto_reconnect: bool,
    pub keep_alive: Duration,
    /// Subscriptions to restore whenever the transport reconnects on its own
    pub resubscribe: Vec<Subscription>,
}

/// Notifications pushed by a transport to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    ConnectionLost(String),
    Message { topic: String, payload: Bytes },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("TLS configuration failed: {0}")]
    Tls(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Subscription failed: {0}")]
    Subscribe(String),
    #[error("Subscription rejected by broker for {topic}")]
    SubscriptionRejected { topic: String },
    #[error("Publishing failed: {0}")]
    Publish(String),
    #[error("Disconnect failed: {0}")]
    Disconnect(String),
    #[error("Not connected")]
    NotConnected,
}

/// Factory creating a transport handle for each connect attempt
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    /// Create a transport for `request`; events are pushed on `events`
    async fn create(
        &self,
        request: ConnectRequest,
        events: TransportEventSender,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// A live connection to the broker
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Resolve once the broker accepted or refused the connection
    async fn connect(&self) -> Result<(), TransportError>;

    /// Subscribe to every filter and wait for the broker's acknowledgement
    async fn subscribe(&self, subscriptions: &[Subscription]) -> Result<(), TransportError>;

    /// Publish an opaque payload
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos)
        -> Result<(), TransportError>;

    /// Close the connection, allowing `grace` for in-flight delivery
    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError>;

    /// Live connectivity state
    fn is_connected(&self) -> bool;
}
