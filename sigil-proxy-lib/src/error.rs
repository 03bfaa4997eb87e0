use thiserror::Error;

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid CIDR range: {0}")]
    InvalidCidr(String),

    #[error("Duplicate user after case folding: {0}")]
    DuplicateUser(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("No private key found in key file")]
    NoPrivateKey,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
