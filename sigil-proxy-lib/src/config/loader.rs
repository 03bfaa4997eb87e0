use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{ProxyError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| ProxyError::Config(format!("Failed to read config file: {e}")))?;
    let mut cfg: Config = serde_json::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("Failed to parse config: {e}")))?;

    // SNI lookups are case-insensitive; fold once here instead of per connection.
    cfg.hosts = cfg
        .hosts
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();

    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<()> {
    if let Some(cert) = &cfg.cert_file {
        if !cert.exists() {
            return Err(ProxyError::Config(format!(
                "Certificate file not found: {}",
                cert.display()
            )));
        }
    }
    if let Some(key) = &cfg.key_file {
        if !key.exists() {
            return Err(ProxyError::Config(format!(
                "Key file not found: {}",
                key.display()
            )));
        }
    }
    if cfg.cert_file.is_some() != cfg.key_file.is_some() {
        return Err(ProxyError::Config(
            "cert_file and key_file must be provided together".to_string(),
        ));
    }

    for (sni, upstream) in &cfg.hosts {
        if upstream.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
            return Err(ProxyError::Config(format!(
                "hosts[{sni}]: upstream must be host:port, got {upstream:?}"
            )));
        }
    }

    Ok(())
}
