//! Pure connection state management for the MQTT transport
//!
//! This module contains connection state, the reconnection backoff policy and
//! the translation of a [`ConnectRequest`] into rumqttc options, TLS included.

use crate::transport::{ConnectRequest, TransportError, TrustAnchors};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::{MqttOptions, TlsConfiguration, Transport as RumqttcTransport};
use std::io::BufReader;
use std::sync::Arc;

/// Default MQTT over TLS port
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// Connection state for the MQTT transport
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for the first ConnAck
    Connecting,
    /// ConnAck received, ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Waiting to reconnect (attempt count)
    Reconnecting(u32),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![1000, 2000, 5000, 10000],
            sustained_delay: 10000,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for given attempt (1-based) using the pattern
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// Extract host and port from a broker URL (pure function)
///
/// The pairing API hands out `mqtts://host:port/` URLs; a missing port
/// defaults to 8883.
pub fn broker_address(broker_url: &url::Url) -> Result<(String, u16), TransportError> {
    let host = broker_url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(broker_url.to_string()))?;
    let port = broker_url.port().unwrap_or(DEFAULT_MQTTS_PORT);
    Ok((host.to_string(), port))
}

/// Build the rustls client configuration for mutual TLS
pub fn build_tls_config(
    certificate_pem: &str,
    private_key_pem: &str,
    trust_anchors: Option<&TrustAnchors>,
) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    match trust_anchors {
        Some(anchors) => {
            let mut reader = BufReader::new(anchors.pem().as_bytes());
            let mut added = 0usize;
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert.map_err(|e| TransportError::Tls(format!("Bad trust anchor: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("Bad trust anchor: {e}")))?;
                added += 1;
            }
            if added == 0 {
                return Err(TransportError::Tls(
                    "No certificates found in trust anchors".to_string(),
                ));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let mut cert_reader = BufReader::new(certificate_pem.as_bytes());
    let chain = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Bad client certificate: {e}")))?;
    if chain.is_empty() {
        return Err(TransportError::Tls(
            "No client certificate found".to_string(),
        ));
    }

    let mut key_reader = BufReader::new(private_key_pem.as_bytes());
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TransportError::Tls(format!("Bad private key: {e}")))?
        .ok_or_else(|| TransportError::Tls("No private key found".to_string()))?;

    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| TransportError::Tls(e.to_string()))
}

/// Pure function to configure MQTT options from a connect request
pub fn configure_mqtt_options(request: &ConnectRequest) -> Result<MqttOptions, TransportError> {
    let (host, port) = broker_address(&request.broker_url)?;

    let mut mqtt_options = MqttOptions::new(request.client_id.clone(), host, port);
    mqtt_options.set_keep_alive(request.keep_alive);
    mqtt_options.set_clean_session(true);
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    let tls = build_tls_config(
        &request.certificate.certificate_pem,
        request.certificate.private_key_pem(),
        request.trust_anchors.as_ref(),
    )?;
    mqtt_options.set_transport(RumqttcTransport::tls_with_config(
        TlsConfiguration::Rustls(Arc::new(tls)),
    ));

    Ok(mqtt_options)
}
