use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main configuration structure, read from a JSON document.
///
/// Unknown keys are rejected at load time so that typos surface immediately
/// instead of silently falling back to defaults.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address and port the Signal-mode tunnel listener binds to
    /// Example: "0.0.0.0:8443"
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Path to the PEM certificate chain
    /// Required whenever a TLS listener is active
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Path to the PEM private key
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Idle relay timeout in seconds; a tunnel with no reads in either
    /// direction for this long is torn down
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
    /// Admission capacity: connections beyond this are rejected, not queued
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,
    /// Address for the metrics scrape listener (optional)
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
    /// SNI -> upstream "host:port" allow-list for Signal mode
    /// Keys are case-folded on load
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

impl Config {
    /// Look up the upstream for an SNI, case-insensitively.
    pub fn upstream_for_sni(&self, sni: &str) -> Option<&str> {
        self.hosts.get(&sni.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_sec)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}

fn default_timeout_sec() -> u64 {
    300
}

fn default_max_conns() -> usize {
    1000
}
