use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sigil_proxy_lib::auth::IdentityStore;
use sigil_proxy_lib::bandwidth::BandwidthTracker;
use sigil_proxy_lib::config::{Config, RuntimeEnv};
use sigil_proxy_lib::engine::{Engine, ProxyState, SessionCounter, Socks5Engine};
use sigil_proxy_lib::limit::RequestLimiter;
use sigil_proxy_lib::telemetry::init_metrics;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("sigil-socks-{nanos}-{name}"))
}

fn pick_free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut s, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = s.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    if s.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn users_file() -> PathBuf {
    let path = tmp_path("users.json");
    let hash = bcrypt::hash("pw", 4).unwrap();
    std::fs::write(
        &path,
        format!(
            r#"{{"users": [{{"username": "alice", "password_hash": "{hash}", "rate_limit_rpm": 0, "enabled": true}}]}}"#
        ),
    )
    .unwrap();
    path
}

fn test_state(socks5_port: u16) -> Arc<ProxyState> {
    let (metrics, _registry) = init_metrics().unwrap();
    let (sessions, _closed_rx) = SessionCounter::new();
    let config = Config {
        listen: "127.0.0.1:0".parse().unwrap(),
        cert_file: None,
        key_file: None,
        timeout_sec: 5,
        max_conns: 64,
        metrics_listen: None,
        hosts: HashMap::new(),
    };
    Arc::new(ProxyState {
        config: Arc::new(config),
        env: RuntimeEnv { socks5_port, ..RuntimeEnv::default() },
        identity: Arc::new(IdentityStore::load(users_file()).unwrap()),
        limiter: Arc::new(RequestLimiter::new()),
        tracker: Arc::new(BandwidthTracker::new(tmp_path("usage.json"))),
        metrics,
        admission: Arc::new(Semaphore::new(64)),
        sessions,
        session_cancel: CancellationToken::new(),
    })
}

async fn start_engine(port: u16) -> (Arc<ProxyState>, CancellationToken) {
    let state = test_state(port);
    let engine = Socks5Engine::new(state.clone());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { engine.run(token).await });
    sleep(Duration::from_millis(50)).await;
    (state, shutdown)
}

async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

#[tokio::test]
async fn connect_round_trip_with_userpass() {
    let echo = spawn_echo_server().await;
    let port = pick_free_port();
    let (state, _shutdown) = start_engine(port).await;

    let mut c = connect(port).await;

    // Method negotiation: offer user/pass only.
    c.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    // RFC 1929 sub-negotiation.
    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(2);
    auth.extend_from_slice(b"pw");
    c.write_all(&auth).await.unwrap();
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x00]);

    // CONNECT to the echo server by IPv4 address.
    let std::net::IpAddr::V4(ip) = echo.ip() else {
        panic!("echo server must be v4")
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&ip.octets());
    req.extend_from_slice(&echo.port().to_be_bytes());
    c.write_all(&req).await.unwrap();

    let mut head = [0u8; 4];
    c.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..2], &[0x05, 0x00]);
    assert_eq!(head[3], 0x01);
    let mut bound = [0u8; 6];
    c.read_exact(&mut bound).await.unwrap();

    // Opaque relay from here.
    c.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    c.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    drop(c);
    sleep(Duration::from_millis(100)).await;
    let usage = state.tracker.usage("alice").expect("bytes were recorded");
    assert_eq!(usage.bytes_up, 4);
    assert_eq!(usage.bytes_down, 4);
}

#[tokio::test]
async fn bad_credentials_are_refused() {
    let port = pick_free_port();
    let (_state, _shutdown) = start_engine(port).await;

    let mut c = connect(port).await;
    c.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x02]);

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(5);
    auth.extend_from_slice(b"wrong");
    c.write_all(&auth).await.unwrap();
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x01]);

    // Connection is closed after the failure reply.
    let mut end = [0u8; 1];
    assert_eq!(c.read(&mut end).await.unwrap_or(0), 0);
}

#[tokio::test]
async fn no_acceptable_method_is_rejected() {
    let port = pick_free_port();
    let (_state, _shutdown) = start_engine(port).await;

    let mut c = connect(port).await;
    // Only no-auth offered, and the client is not in a super-admin range.
    c.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);
}

#[tokio::test]
async fn non_connect_commands_are_refused() {
    let port = pick_free_port();
    let (_state, _shutdown) = start_engine(port).await;

    let mut c = connect(port).await;
    c.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    c.read_exact(&mut reply).await.unwrap();

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(2);
    auth.extend_from_slice(b"pw");
    c.write_all(&auth).await.unwrap();
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x01, 0x00]);

    // BIND is not supported.
    c.write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    let mut head = [0u8; 4];
    c.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x07);
}

#[tokio::test]
async fn unreachable_host_reports_host_unreachable() {
    let port = pick_free_port();
    let (_state, _shutdown) = start_engine(port).await;
    // A port nothing listens on.
    let dead_port = pick_free_port();

    let mut c = connect(port).await;
    c.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    c.read_exact(&mut reply).await.unwrap();

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(2);
    auth.extend_from_slice(b"pw");
    c.write_all(&auth).await.unwrap();
    c.read_exact(&mut reply).await.unwrap();

    let mut req = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    req.extend_from_slice(&dead_port.to_be_bytes());
    c.write_all(&req).await.unwrap();
    let mut head = [0u8; 4];
    c.read_exact(&mut head).await.unwrap();
    assert_eq!(head[1], 0x04);
}

#[tokio::test]
async fn domain_addresses_resolve() {
    let echo = spawn_echo_server().await;
    let port = pick_free_port();
    let (_state, _shutdown) = start_engine(port).await;

    let mut c = connect(port).await;
    c.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut reply = [0u8; 2];
    c.read_exact(&mut reply).await.unwrap();

    let mut auth = vec![0x01, 5];
    auth.extend_from_slice(b"alice");
    auth.push(2);
    auth.extend_from_slice(b"pw");
    c.write_all(&auth).await.unwrap();
    c.read_exact(&mut reply).await.unwrap();

    let name = b"localhost";
    let mut req = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    req.extend_from_slice(name);
    req.extend_from_slice(&echo.port().to_be_bytes());
    c.write_all(&req).await.unwrap();

    let mut head = [0u8; 4];
    c.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..2], &[0x05, 0x00]);
    let addr_len = if head[3] == 0x01 { 6 } else { 18 };
    let mut bound = vec![0u8; addr_len];
    c.read_exact(&mut bound).await.unwrap();

    c.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    c.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}
