use std::io::Write;
use std::path::PathBuf;

use serial_test::serial;
use sigil_proxy_lib::config::{load_from_path, ProxyMode, RuntimeEnv};
use tempfile::NamedTempFile;

fn write_config(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_minimal_config_with_defaults() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let file = write_config(r#"{}"#);

    let cfg = load_from_path(file.path())?;
    assert_eq!(cfg.listen.port(), 8443);
    assert_eq!(cfg.timeout_sec, 300);
    assert_eq!(cfg.max_conns, 1000);
    assert!(cfg.hosts.is_empty());
    assert!(cfg.cert_file.is_none());
    Ok(())
}

#[test]
fn loads_hosts_and_folds_case() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let file = write_config(
        r#"{
            "listen": "127.0.0.1:0",
            "timeout_sec": 60,
            "hosts": {
                "Chat.Example": "upstream:443",
                "media.example": "media-upstream:443"
            }
        }"#,
    );

    let cfg = load_from_path(file.path())?;
    assert_eq!(cfg.upstream_for_sni("chat.example"), Some("upstream:443"));
    assert_eq!(cfg.upstream_for_sni("CHAT.EXAMPLE"), Some("upstream:443"));
    assert_eq!(cfg.upstream_for_sni("media.example"), Some("media-upstream:443"));
    assert_eq!(cfg.upstream_for_sni("evil.example"), None);
    Ok(())
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_config(r#"{"listne": "127.0.0.1:0"}"#);
    assert!(load_from_path(file.path()).is_err());
}

#[test]
fn missing_certificate_file_fails_validation() {
    let file = write_config(
        r#"{"cert_file": "/nonexistent/cert.pem", "key_file": "/nonexistent/key.pem"}"#,
    );
    assert!(load_from_path(file.path()).is_err());
}

#[test]
fn upstream_without_port_is_rejected() {
    let file = write_config(r#"{"hosts": {"chat.example": "upstream"}}"#);
    assert!(load_from_path(file.path()).is_err());
}

#[test]
#[serial]
fn env_defaults_apply() {
    for var in [
        "APP_ENV",
        "PROXY_MODE",
        "HTTP_PROXY_PORT",
        "HTTP_PROXY_TLS",
        "HTTP_PROXY_TLS_PORT",
        "SOCKS5_PORT",
        "USERS_FILE",
        "PAC_ENABLED",
        "PAC_TOKEN",
        "PAC_DEFAULT_USER",
        "PAC_RATE_LIMIT_RPM",
    ] {
        std::env::remove_var(var);
    }

    let env = RuntimeEnv::from_env().expect("defaults must parse");
    assert_eq!(env.proxy_mode, ProxyMode::Signal);
    assert_eq!(env.http_proxy_port, 8080);
    assert!(env.http_proxy_tls);
    assert_eq!(env.http_proxy_tls_port, 8443);
    assert_eq!(env.socks5_port, 1080);
    assert_eq!(env.users_file, PathBuf::from("users.json"));
    assert!(!env.pac.enabled);
}

#[test]
#[serial]
fn env_overrides_apply() {
    std::env::set_var("PROXY_MODE", "general");
    std::env::set_var("HTTP_PROXY_PORT", ":9090");
    std::env::set_var("SOCKS5_PORT", "9999");
    std::env::set_var("PAC_ENABLED", "true");
    std::env::set_var("PAC_TOKEN", "sekrit");

    let env = RuntimeEnv::from_env().expect("overrides must parse");
    assert_eq!(env.proxy_mode, ProxyMode::General);
    assert_eq!(env.http_proxy_port, 9090);
    assert_eq!(env.socks5_port, 9999);
    assert!(env.pac.enabled);
    assert_eq!(env.pac.token.as_deref(), Some("sekrit"));

    for var in ["PROXY_MODE", "HTTP_PROXY_PORT", "SOCKS5_PORT", "PAC_ENABLED", "PAC_TOKEN"] {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn bad_env_values_fail() {
    std::env::set_var("PROXY_MODE", "warp-drive");
    assert!(RuntimeEnv::from_env().is_err());
    std::env::remove_var("PROXY_MODE");

    std::env::set_var("HTTP_PROXY_PORT", "not-a-port");
    assert!(RuntimeEnv::from_env().is_err());
    std::env::remove_var("HTTP_PROXY_PORT");
}
