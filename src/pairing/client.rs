//! HTTP implementation of the pairing API
//!
//! Every request carries the device's credentials secret as a bearer token.

use super::certificate::{generate_csr, CertificateStore, ClientCertificate};
use super::{DeviceIdentity, PairingApi, PairingError};
use crate::error::sanitize_error_message;
use crate::transport::TrustAnchors;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Name of the MQTT protocol entry in the pairing API
const MQTT_PROTOCOL: &str = "astarte_mqtt_v1";

/// Pairing client configuration
#[derive(Debug, Clone)]
pub struct PairingClientConfig {
    pub base_url: Url,
    pub timeout: Duration,
    pub trust_anchors: Option<TrustAnchors>,
}

impl PairingClientConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(30),
            trust_anchors: None,
        }
    }
}

/// Pairing API client
pub struct PairingClient {
    config: PairingClientConfig,
    client: Client,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct DeviceInfo {
    protocols: DeviceProtocols,
}

#[derive(Debug, Deserialize)]
struct DeviceProtocols {
    astarte_mqtt_v1: MqttProtocolInfo,
}

#[derive(Debug, Deserialize)]
struct MqttProtocolInfo {
    broker_url: String,
}

#[derive(Debug, Serialize)]
struct CsrRequest<'a> {
    csr: &'a str,
}

#[derive(Debug, Deserialize)]
struct CredentialsResponse {
    client_crt: String,
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    client_crt: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
    #[serde(default)]
    cause: Option<String>,
}

impl PairingClient {
    /// Create a new pairing client
    pub fn new(config: PairingClientConfig) -> Result<Self, PairingError> {
        let mut builder = Client::builder().timeout(config.timeout);

        if let Some(anchors) = &config.trust_anchors {
            let cert = reqwest::Certificate::from_pem(anchors.pem().as_bytes())
                .map_err(|e| PairingError::Request(format!("Invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| PairingError::Request(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { config, client })
    }

    /// Build an endpoint URL below the device resource (pure function)
    fn device_url(base_url: &Url, identity: &DeviceIdentity, suffix: &str) -> Result<Url, PairingError> {
        let raw = format!(
            "{}/v1/{}/devices/{}{}",
            base_url.as_str().trim_end_matches('/'),
            identity.realm,
            identity.device_id,
            suffix
        );
        Url::parse(&raw).map_err(|e| PairingError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// Parse the broker URL out of the device info (pure function)
    fn parse_broker_url(info: DeviceInfo) -> Result<Url, PairingError> {
        let raw = info.protocols.astarte_mqtt_v1.broker_url;
        Url::parse(&raw)
            .map_err(|e| PairingError::InvalidResponse(format!("Bad broker URL {raw}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        identity: &DeviceIdentity,
    ) -> Result<T, PairingError> {
        let request = self
            .client
            .get(url)
            .header(
                "Authorization",
                format!("Bearer {}", identity.credentials_secret()),
            );
        Self::execute(request).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: Url,
        identity: &DeviceIdentity,
        body: &B,
    ) -> Result<T, PairingError> {
        let request = self
            .client
            .post(url)
            .header(
                "Authorization",
                format!("Bearer {}", identity.credentials_secret()),
            )
            .json(body);
        Self::execute(request).await
    }

    /// Send a request and unwrap the `data` envelope (impure I/O)
    async fn execute<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
    ) -> Result<T, PairingError> {
        let response = request
            .send()
            .await
            .map_err(|e| PairingError::Request(sanitize_error_message(&e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = sanitize_error_message(&body);
            warn!(status = status.as_u16(), "Pairing API error: {}", message);
            return Err(PairingError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: DataEnvelope<T> = response
            .json()
            .await
            .map_err(|e| PairingError::InvalidResponse(e.to_string()))?;
        Ok(envelope.data)
    }

    /// Ask the pairing API whether a certificate is still valid
    pub async fn verify_certificate(
        &self,
        identity: &DeviceIdentity,
        certificate_pem: &str,
    ) -> Result<bool, PairingError> {
        let url = Self::device_url(
            &self.config.base_url,
            identity,
            &format!("/protocols/{MQTT_PROTOCOL}/credentials/verify"),
        )?;
        let response: VerifyResponse = self
            .post_json(
                url,
                identity,
                &DataEnvelope {
                    data: VerifyRequest {
                        client_crt: certificate_pem,
                    },
                },
            )
            .await?;

        if !response.valid {
            debug!(
                device_id = %identity.device_id,
                cause = response.cause.as_deref().unwrap_or("unknown"),
                "Stored certificate rejected"
            );
        }
        Ok(response.valid)
    }

    /// Obtain a new certificate for a freshly generated key pair
    pub async fn request_certificate(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<ClientCertificate, PairingError> {
        let csr = generate_csr(&identity.client_id())?;
        let url = Self::device_url(
            &self.config.base_url,
            identity,
            &format!("/protocols/{MQTT_PROTOCOL}/credentials"),
        )?;
        let response: CredentialsResponse = self
            .post_json(
                url,
                identity,
                &DataEnvelope {
                    data: CsrRequest { csr: &csr.csr_pem },
                },
            )
            .await?;

        Ok(ClientCertificate::new(
            response.client_crt,
            csr.private_key_pem,
        ))
    }
}

#[async_trait]
impl PairingApi for PairingClient {
    async fn broker_url(&self, identity: &DeviceIdentity) -> Result<Url, PairingError> {
        let url = Self::device_url(&self.config.base_url, identity, "")?;
        let info: DeviceInfo = self.get_json(url, identity).await?;
        let broker_url = Self::parse_broker_url(info)?;

        debug!(device_id = %identity.device_id, broker_url = %broker_url, "Resolved broker URL");
        Ok(broker_url)
    }

    async fn ensure_certificate(
        &self,
        identity: &DeviceIdentity,
        persistency_dir: &Path,
    ) -> Result<ClientCertificate, PairingError> {
        let store = CertificateStore::new(persistency_dir);

        if let Some(stored) = store.load().await? {
            if self
                .verify_certificate(identity, &stored.certificate_pem)
                .await?
            {
                debug!(device_id = %identity.device_id, "Reusing stored client certificate");
                return Ok(stored);
            }
            store.clear().await?;
        }

        info!(device_id = %identity.device_id, "Requesting new client certificate");
        let certificate = self.request_certificate(identity).await?;
        store.save(&certificate).await?;
        Ok(certificate)
    }
}
