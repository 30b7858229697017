//! Pairing collaborator: broker discovery and client certificates
//!
//! The connection lifecycle only depends on the [`PairingApi`] trait.
//! [`PairingClient`] is the HTTP implementation used in production.

use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use url::Url;

pub mod certificate;
pub mod client;

pub use certificate::{generate_csr, CertificateSigningRequest, CertificateStore, ClientCertificate};
pub use client::{PairingClient, PairingClientConfig};

/// Who the device is, as seen by the pairing API
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub realm: String,
    pub device_id: String,
    credentials_secret: String,
}

impl DeviceIdentity {
    pub fn new(
        realm: impl Into<String>,
        device_id: impl Into<String>,
        credentials_secret: impl Into<String>,
    ) -> Self {
        Self {
            realm: realm.into(),
            device_id: device_id.into(),
            credentials_secret: credentials_secret.into(),
        }
    }

    /// Bearer token for the pairing API
    pub fn credentials_secret(&self) -> &str {
        &self.credentials_secret
    }

    /// Client id and certificate common name: `{realm}/{device_id}`
    pub fn client_id(&self) -> String {
        format!("{}/{}", self.realm, self.device_id)
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("realm", &self.realm)
            .field("device_id", &self.device_id)
            .field("credentials_secret", &"***")
            .finish()
    }
}

/// Pairing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("Invalid pairing URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Pairing API returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("Invalid pairing API response: {0}")]
    InvalidResponse(String),
    #[error("Failed to generate certificate request: {0}")]
    Csr(String),
    #[error("Certificate storage error: {0}")]
    Storage(String),
}

/// Operations the connection lifecycle needs from the pairing service
#[async_trait]
pub trait PairingApi: Send + Sync {
    /// Resolve the broker endpoint assigned to the device
    async fn broker_url(&self, identity: &DeviceIdentity) -> Result<Url, PairingError>;

    /// Return a valid client certificate, obtaining a new one when needed
    async fn ensure_certificate(
        &self,
        identity: &DeviceIdentity,
        persistency_dir: &Path,
    ) -> Result<ClientCertificate, PairingError>;
}
