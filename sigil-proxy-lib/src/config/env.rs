use std::env;
use std::path::PathBuf;

use crate::error::{ProxyError, Result};

/// Deployment environment, from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnv {
    #[default]
    Development,
    Production,
}

/// Which engine set the supervisor starts, from `PROXY_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyMode {
    /// SNI-routed TLS tunnel listener only
    #[default]
    Signal,
    /// HTTP proxy, plaintext listener only
    Http,
    /// HTTP proxy with plaintext and TLS listeners
    Https,
    /// HTTP proxy (both listeners) plus SOCKS5
    General,
}

/// PAC responder options.
#[derive(Debug, Clone, Default)]
pub struct PacOptions {
    pub enabled: bool,
    /// Shared secret; when set, requests must carry it as `token=`
    pub token: Option<String>,
    /// Username embedded in the script when the request names none
    pub default_user: Option<String>,
    /// Per-client-IP requests per minute (0 disables the limit)
    pub rate_limit_rpm: u32,
}

/// Options read from the process environment. These override the JSON
/// config where the two overlap.
#[derive(Debug, Clone)]
pub struct RuntimeEnv {
    pub app_env: AppEnv,
    pub proxy_mode: ProxyMode,
    pub http_proxy_port: u16,
    pub http_proxy_tls: bool,
    pub http_proxy_tls_port: u16,
    pub socks5_port: u16,
    pub users_file: PathBuf,
    pub pac: PacOptions,
}

impl Default for RuntimeEnv {
    fn default() -> Self {
        Self {
            app_env: AppEnv::default(),
            proxy_mode: ProxyMode::default(),
            http_proxy_port: 8080,
            http_proxy_tls: true,
            http_proxy_tls_port: 8443,
            socks5_port: 1080,
            users_file: PathBuf::from("users.json"),
            pac: PacOptions { rate_limit_rpm: 60, ..PacOptions::default() },
        }
    }
}

impl RuntimeEnv {
    /// Parse the recognized environment options, falling back to defaults
    /// for unset variables and failing on unparsable values.
    pub fn from_env() -> Result<Self> {
        let mut rt = Self::default();

        if let Ok(v) = env::var("APP_ENV") {
            rt.app_env = match v.as_str() {
                "development" => AppEnv::Development,
                "production" => AppEnv::Production,
                other => {
                    return Err(ProxyError::Config(format!("APP_ENV: unknown value {other:?}")))
                }
            };
        }
        if let Ok(v) = env::var("PROXY_MODE") {
            rt.proxy_mode = match v.as_str() {
                "signal" => ProxyMode::Signal,
                "http" => ProxyMode::Http,
                "https" => ProxyMode::Https,
                "general" => ProxyMode::General,
                other => {
                    return Err(ProxyError::Config(format!("PROXY_MODE: unknown value {other:?}")))
                }
            };
        }

        rt.http_proxy_port = parse_port("HTTP_PROXY_PORT", rt.http_proxy_port)?;
        rt.http_proxy_tls = parse_bool("HTTP_PROXY_TLS", rt.http_proxy_tls)?;
        rt.http_proxy_tls_port = parse_port("HTTP_PROXY_TLS_PORT", rt.http_proxy_tls_port)?;
        rt.socks5_port = parse_port("SOCKS5_PORT", rt.socks5_port)?;

        if let Ok(v) = env::var("USERS_FILE") {
            rt.users_file = PathBuf::from(v);
        }

        rt.pac.enabled = parse_bool("PAC_ENABLED", rt.pac.enabled)?;
        rt.pac.token = env::var("PAC_TOKEN").ok().filter(|s| !s.is_empty());
        rt.pac.default_user = env::var("PAC_DEFAULT_USER").ok().filter(|s| !s.is_empty());
        if let Ok(v) = env::var("PAC_RATE_LIMIT_RPM") {
            rt.pac.rate_limit_rpm = v
                .parse()
                .map_err(|_| ProxyError::Config(format!("PAC_RATE_LIMIT_RPM: bad value {v:?}")))?;
        }

        Ok(rt)
    }
}

fn parse_port(name: &str, default: u16) -> Result<u16> {
    match env::var(name) {
        Ok(v) => {
            // Accept ":8080" as well as "8080"; operators copy both forms around.
            let trimmed = v.trim_start_matches(':');
            trimmed
                .parse()
                .map_err(|_| ProxyError::Config(format!("{name}: bad port {v:?}")))
        }
        Err(_) => Ok(default),
    }
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) => match v.as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ProxyError::Config(format!("{name}: bad boolean {other:?}"))),
        },
        Err(_) => Ok(default),
    }
}
