//! Device construction

use super::events::EventFanout;
use super::{ConnectionOptions, ConnectionTimings, Device, DeviceInner};
use crate::config::{ConfigError, DeviceConfig};
use crate::error::{DeviceError, DeviceResult};
use crate::interfaces::{Interface, InterfaceRegistry};
use crate::pairing::{DeviceIdentity, PairingApi, PairingClient, PairingClientConfig};
use crate::protocol::{is_valid_device_id, TopicBuilder};
use crate::transport::mqtt::MqttConnector;
use crate::transport::{TransportConnector, TrustAnchors};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::info;
use url::Url;

/// Builder for [`Device`]
///
/// Nothing touches the filesystem or the network before [`DeviceBuilder::build`],
/// and `build` validates the device id before anything else.
pub struct DeviceBuilder {
    device_id: String,
    realm: String,
    credentials_secret: String,
    pairing: Option<Arc<dyn PairingApi>>,
    pairing_url: Option<String>,
    connector: Option<Arc<dyn TransportConnector>>,
    persistency_dir: Option<PathBuf>,
    options: ConnectionOptions,
    timings: ConnectionTimings,
    keep_alive: Duration,
    interfaces: Vec<Interface>,
}

impl DeviceBuilder {
    pub fn new(device_id: &str, realm: &str, credentials_secret: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            realm: realm.to_string(),
            credentials_secret: credentials_secret.to_string(),
            pairing: None,
            pairing_url: None,
            connector: None,
            persistency_dir: None,
            options: ConnectionOptions::default(),
            timings: ConnectionTimings::default(),
            keep_alive: Duration::from_secs(60),
            interfaces: Vec::new(),
        }
    }

    /// Builder preloaded from a configuration file
    ///
    /// Reads the credentials secret from its environment variable, the trust
    /// anchors file and every interface definition the configuration names.
    pub fn from_config(config: &DeviceConfig) -> DeviceResult<Self> {
        let secret = config.get_credentials_secret()?;
        let connection = &config.connection;

        let mut builder = Self::new(&config.device.id, &config.device.realm, &secret)
            .pairing_url(config.pairing_url()?.as_str())
            .auto_reconnect(connection.auto_reconnect)
            .keep_alive(connection.keep_alive())
            .timings(ConnectionTimings {
                broker_retry_interval: connection.broker_retry_interval(),
                connect_timeout: connection.connect_timeout(),
                disconnect_grace: connection.disconnect_grace(),
            });

        if let Some(dir) = &config.device.persistency_dir {
            builder = builder.persistency_dir(dir.clone());
        }

        if let Some(path) = &connection.trust_anchors {
            let anchors = TrustAnchors::from_pem_file(path).map_err(ConfigError::FileRead)?;
            builder = builder.trust_anchors(anchors);
        }

        for interface in config.load_interfaces()? {
            builder = builder.interface(interface);
        }

        Ok(builder)
    }

    /// Base URL of the HTTP pairing API
    pub fn pairing_url(mut self, url: &str) -> Self {
        self.pairing_url = Some(url.to_string());
        self
    }

    /// Use a custom pairing implementation instead of the HTTP client
    pub fn pairing(mut self, pairing: Arc<dyn PairingApi>) -> Self {
        self.pairing = Some(pairing);
        self
    }

    /// Use a custom transport instead of MQTT
    pub fn connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn persistency_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persistency_dir = Some(dir.into());
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.options.auto_reconnect = enabled;
        self
    }

    pub fn trust_anchors(mut self, anchors: TrustAnchors) -> Self {
        self.options.trust_anchors = Some(anchors);
        self
    }

    pub fn timings(mut self, timings: ConnectionTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Register an interface when the device is built
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn build(self) -> DeviceResult<Device> {
        if !is_valid_device_id(&self.device_id) {
            return Err(DeviceError::InvalidDeviceId(self.device_id));
        }

        let mut registry = InterfaceRegistry::new();
        for interface in self.interfaces {
            registry.add(interface)?;
        }

        let identity = DeviceIdentity::new(&self.realm, &self.device_id, self.credentials_secret);

        let pairing: Arc<dyn PairingApi> = match (self.pairing, self.pairing_url) {
            (Some(pairing), _) => pairing,
            (None, Some(url)) => {
                let base_url = Url::parse(&url).map_err(|e| {
                    ConfigError::InvalidConfig(format!("pairing URL '{url}' is not valid: {e}"))
                })?;
                let mut config = PairingClientConfig::new(base_url);
                config.trust_anchors = self.options.trust_anchors.clone();
                Arc::new(PairingClient::new(config)?)
            }
            (None, None) => {
                return Err(ConfigError::InvalidConfig(
                    "a pairing URL or pairing implementation is required".to_string(),
                )
                .into())
            }
        };

        let connector: Arc<dyn TransportConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(MqttConnector::default()),
        };

        let persistency_dir = self.persistency_dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("astarte-device-{}", self.device_id))
        });
        std::fs::create_dir_all(&persistency_dir)
            .map_err(|e| DeviceError::persistency(&persistency_dir, e))?;

        info!(
            device_id = %self.device_id,
            realm = %self.realm,
            persistency_dir = %persistency_dir.display(),
            interfaces = registry.len(),
            "Device created"
        );

        Ok(Device {
            inner: Arc::new(DeviceInner {
                base_topic: TopicBuilder::base_topic(&self.realm, &self.device_id),
                identity,
                persistency_dir,
                registry: RwLock::new(registry),
                options: RwLock::new(self.options),
                timings: self.timings,
                keep_alive: self.keep_alive,
                pairing,
                connector,
                transport: RwLock::new(None),
                next_generation: AtomicU64::new(1),
                ready_generation: AtomicU64::new(0),
                reported_connected: AtomicBool::new(false),
                handshake: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                fanout: EventFanout::new(),
            }),
        })
    }
}
