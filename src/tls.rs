//! Loading of x509 materials for the gRPC listener and its clients.

use std::path::PathBuf;

use tokio::fs;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("server certificate path not configured")]
    MissingCert,

    #[error("private key path not configured")]
    MissingKey,

    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("failed to read TLS material: {0}")]
    Io(#[from] std::io::Error),
}

/// PEM materials loaded once at startup and reused for every listener.
#[derive(Clone)]
pub struct TlsIdentity {
    identity: Identity,
    ca_cert: Certificate,
}

impl TlsIdentity {
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;
        let ca_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;

        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }
        if !ca_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_path.clone()));
        }

        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;
        let ca_pem = fs::read(ca_path).await?;

        Ok(Self {
            identity: Identity::from_pem(cert_pem, key_pem),
            ca_cert: Certificate::from_pem(ca_pem),
        })
    }

    /// Server side: present our identity and verify client certificates
    /// against the CA.
    pub fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity.clone())
            .client_ca_root(self.ca_cert.clone())
    }

    /// Client side: present our identity and verify the server against the
    /// CA. Validation is CA-trust based, not hostname based.
    pub fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .domain_name("backplane")
            .ca_certificate(self.ca_cert.clone())
            .identity(self.identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_fails_on_unconfigured_paths() {
        let config = TlsConfig::default();
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::MissingCert)));
    }

    #[tokio::test]
    async fn load_fails_on_missing_files() {
        let config = TlsConfig {
            cert_path: Some(PathBuf::from("/nonexistent/server.crt")),
            key_path: Some(PathBuf::from("/nonexistent/server.key")),
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::CertNotFound(_))));
    }
}
