use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_rustls::rustls::crypto::aws_lc_rs;
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{version, ServerConfig};
use tracing::info;

use crate::error::{ProxyError, Result};
use crate::tls::read_cert_pair;

/// Certificate resolver whose pair can be swapped while listeners are
/// live. The TLS stack calls [`ResolvesServerCert::resolve`] on every
/// handshake, so a swap takes effect for the next connection with no
/// listener restart.
pub struct ReloadingCertResolver {
    current: ArcSwap<CertifiedKey>,
    cert_path: PathBuf,
    key_path: PathBuf,
}

impl fmt::Debug for ReloadingCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadingCertResolver")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl ReloadingCertResolver {
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Arc<Self>> {
        let certified = load_certified_key(cert_path, key_path)?;
        Ok(Arc::new(Self {
            current: ArcSwap::from_pointee(certified),
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
        }))
    }

    /// Re-read the pair from disk and swap it in. On failure the previous
    /// pair stays active.
    pub fn reload(&self) -> Result<()> {
        let certified = load_certified_key(&self.cert_path, &self.key_path)?;
        self.current.store(Arc::new(certified));
        info!(cert = %self.cert_path.display(), "certificate pair reloaded");
        Ok(())
    }
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.load_full())
    }
}

fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    let pair = read_cert_pair(cert_path, key_path)?;
    let signing_key = aws_lc_rs::sign::any_supported_type(&pair.key)
        .map_err(|e| ProxyError::Tls(format!("Unsupported private key: {e}")))?;
    Ok(CertifiedKey::new(pair.certs, signing_key))
}

/// Server-side TLS configuration with the dynamic resolver. TLS 1.2 is the
/// protocol floor.
pub fn build_server_config(resolver: Arc<ReloadingCertResolver>) -> ServerConfig {
    ServerConfig::builder_with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .with_no_client_auth()
        .with_cert_resolver(resolver)
}
