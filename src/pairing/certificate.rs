//! Client certificate material, CSR generation and on-disk storage

use super::PairingError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the stored client certificate
pub const CERTIFICATE_FILE: &str = "device.crt";

/// File name of the stored private key
pub const PRIVATE_KEY_FILE: &str = "device.key";

/// PEM-encoded client certificate and its private key
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub certificate_pem: String,
    private_key_pem: String,
}

impl ClientCertificate {
    pub fn new(certificate_pem: impl Into<String>, private_key_pem: impl Into<String>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            private_key_pem: private_key_pem.into(),
        }
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("certificate_pem", &format!("{} bytes", self.certificate_pem.len()))
            .field("private_key_pem", &"***")
            .finish()
    }
}

/// A fresh key pair and the signing request built from it
pub struct CertificateSigningRequest {
    pub csr_pem: String,
    pub private_key_pem: String,
}

/// Generate a key pair and a CSR with `common_name` as subject CN
pub fn generate_csr(common_name: &str) -> Result<CertificateSigningRequest, PairingError> {
    let key_pair = KeyPair::generate().map_err(|e| PairingError::Csr(e.to_string()))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| PairingError::Csr(e.to_string()))?;
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| PairingError::Csr(e.to_string()))?;
    let csr_pem = csr.pem().map_err(|e| PairingError::Csr(e.to_string()))?;

    Ok(CertificateSigningRequest {
        csr_pem,
        private_key_pem: key_pair.serialize_pem(),
    })
}

/// Certificate files kept in the device's persistency directory
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn certificate_path(&self) -> PathBuf {
        self.dir.join(CERTIFICATE_FILE)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    /// Load the stored certificate; `None` when either file is missing
    pub async fn load(&self) -> Result<Option<ClientCertificate>, PairingError> {
        let certificate = match read_optional(&self.certificate_path()).await? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let private_key = match read_optional(&self.private_key_path()).await? {
            Some(pem) => pem,
            None => return Ok(None),
        };

        Ok(Some(ClientCertificate::new(certificate, private_key)))
    }

    /// Persist a certificate, creating the directory if needed
    pub async fn save(&self, certificate: &ClientCertificate) -> Result<(), PairingError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(storage_error)?;
        tokio::fs::write(self.private_key_path(), certificate.private_key_pem())
            .await
            .map_err(storage_error)?;
        restrict_permissions(&self.private_key_path()).await?;
        tokio::fs::write(self.certificate_path(), &certificate.certificate_pem)
            .await
            .map_err(storage_error)?;

        debug!(dir = %self.dir.display(), "Stored client certificate");
        Ok(())
    }

    /// Delete the stored certificate files, ignoring missing ones
    pub async fn clear(&self) -> Result<(), PairingError> {
        for path in [self.certificate_path(), self.private_key_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(storage_error(e)),
            }
        }
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, PairingError> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(storage_error(e)),
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<(), PairingError> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(storage_error)
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<(), PairingError> {
    Ok(())
}

fn storage_error(error: std::io::Error) -> PairingError {
    PairingError::Storage(error.to_string())
}
