use std::fs;
use std::path::Path;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{ProxyError, Result};

/// A certificate chain with its private key, as read from PEM files.
#[derive(Debug)]
pub struct CertKeyPair {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for CertKeyPair {
    fn clone(&self) -> Self {
        Self { certs: self.certs.to_vec(), key: self.key.clone_key() }
    }
}

/// Read a certificate chain and private key from PEM files.
pub fn read_cert_pair(cert_path: &Path, key_path: &Path) -> Result<CertKeyPair> {
    let cert_bytes = fs::read(cert_path).map_err(|e| {
        ProxyError::Tls(format!("Unable to load the certificates [{}]: {e}", cert_path.display()))
    })?;
    let certs = CertificateDer::pem_slice_iter(&cert_bytes)
        .collect::<std::result::Result<Vec<_>, rustls_pki_types::pem::Error>>()
        .map_err(|e| ProxyError::Tls(format!("Unable to parse the certificates: {e}")))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls("No certificates found".to_string()));
    }

    let key_bytes = fs::read(key_path).map_err(|e| {
        ProxyError::Tls(format!("Unable to load the private key [{}]: {e}", key_path.display()))
    })?;
    let mut keys: Vec<PrivateKeyDer<'static>> = PrivateKeyDer::pem_slice_iter(&key_bytes)
        .collect::<std::result::Result<Vec<_>, rustls_pki_types::pem::Error>>()
        .map_err(|e| ProxyError::Tls(format!("Unable to parse the private keys: {e}")))?;

    let key = keys.pop().ok_or(ProxyError::NoPrivateKey)?;

    Ok(CertKeyPair { certs, key })
}
