use std::path::{Path, PathBuf};
use std::{fs, io};
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// Where a node finds its TLS material on disk.
#[derive(Clone, Debug)]
pub struct TlsPaths {
    /// Trust root shared by the whole cluster. Verifies servers and clients alike.
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read '{path}': {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("invalid TLS configuration: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// TlsConfig is the mutual TLS identity of one node, PEM encoded.
///
/// The same certificate is presented when serving and when dialing peers, so it must be usable
/// for both server and client authentication.
#[derive(Clone)]
pub struct TlsConfig {
    ca_cert_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    // Name we expect peers' server certificates to be issued for.
    server_name: String,
}

impl TlsConfig {
    pub fn from_pem(
        ca_cert_pem: impl Into<Vec<u8>>,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
        server_name: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_pem: ca_cert_pem.into(),
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
            server_name: server_name.into(),
        }
    }

    pub fn load(paths: &TlsPaths, server_name: impl Into<String>) -> Result<Self, TlsError> {
        Ok(Self::from_pem(
            read(&paths.ca_cert)?,
            read(&paths.cert)?,
            read(&paths.key)?,
            server_name,
        ))
    }

    /// Server side: present our identity, and require clients to present one signed by the CA.
    pub(crate) fn server_tls_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(self.identity())
            .client_ca_root(self.ca_certificate())
    }

    /// Client side: verify the server against the CA, and present our own identity.
    pub(crate) fn client_tls_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .ca_certificate(self.ca_certificate())
            .identity(self.identity())
            .domain_name(self.server_name.clone())
    }

    fn identity(&self) -> Identity {
        Identity::from_pem(&self.cert_pem, &self.key_pem)
    }

    fn ca_certificate(&self) -> Certificate {
        Certificate::from_pem(&self.ca_cert_pem)
    }
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_reports_the_missing_file() {
        let paths = TlsPaths {
            ca_cert: PathBuf::from("/nonexistent/replog/ca.pem"),
            cert: PathBuf::from("/nonexistent/replog/node.pem"),
            key: PathBuf::from("/nonexistent/replog/node-key.pem"),
        };

        match TlsConfig::load(&paths, "localhost") {
            Err(TlsError::Read { path, .. }) => assert_eq!(path, paths.ca_cert),
            Err(e) => panic!("Unexpected error {:?}", e),
            Ok(_) => panic!("Expected read failure"),
        }
    }
}
