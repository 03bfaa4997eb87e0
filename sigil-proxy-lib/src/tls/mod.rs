mod loader;
mod resolver;

pub use loader::{read_cert_pair, CertKeyPair};
pub use resolver::{build_server_config, ReloadingCertResolver};
