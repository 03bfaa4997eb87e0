use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::User;
use crate::engine::{Engine, PolicyRejection, ProxyState, SessionPermit};
use crate::error::{ProxyError, Result};
use crate::limit::ThrottledStream;
use crate::relay::relay;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// RFC 1928/1929 proxy: username/password authentication, CONNECT only.
pub struct Socks5Engine {
    state: Arc<ProxyState>,
}

impl Socks5Engine {
    pub fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Engine for Socks5Engine {
    fn name(&self) -> &'static str {
        "socks5"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.env.socks5_port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Config(format!("socks5 listener bind failed: {e}")))?;
        info!(%addr, "socks5 listener bound");

        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = shutdown.cancelled() => {
                    info!("socks5 listener closing");
                    return Ok(());
                }
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            let Some(permit) = self.state.try_admit() else {
                self.state.metrics.connections_rejected_total.add(1, &[]);
                warn!(%peer, "connection limit reached, rejecting");
                continue;
            };
            let state = self.state.clone();
            tokio::spawn(async move {
                handle_socks(state, stream, peer, permit).await;
            });
        }
    }
}

struct Negotiated {
    user: Arc<User>,
    bypass: bool,
    target: String,
}

async fn handle_socks(
    state: Arc<ProxyState>,
    mut stream: TcpStream,
    peer: SocketAddr,
    permit: SessionPermit,
) {
    let _permit = permit;

    let negotiated =
        match timeout(NEGOTIATION_TIMEOUT, negotiate(&state, &mut stream, peer.ip())).await {
            Ok(Some(n)) => n,
            Ok(None) => return,
            Err(_) => {
                state
                    .metrics
                    .errors_total
                    .add(1, &[KeyValue::new("type", "socks_timeout")]);
                return;
            }
        };
    let Negotiated { user, bypass, target } = negotiated;

    if !bypass {
        if let Some(rejection) = state.check_user_policy(&user, peer.ip()) {
            match rejection {
                // Rate-limited clients get a plain close.
                PolicyRejection::RateLimited => {
                    state
                        .metrics
                        .rate_limited_total
                        .add(1, &[KeyValue::new("user", user.username.clone())]);
                }
                PolicyRejection::Expired | PolicyRejection::TooManyConnections => {
                    let _ = write_reply(&mut stream, REP_NOT_ALLOWED, None).await;
                }
                PolicyRejection::BandwidthExceeded => {
                    state
                        .metrics
                        .errors_total
                        .add(1, &[KeyValue::new("type", "bandwidth_exceeded")]);
                    let _ = write_reply(&mut stream, REP_HOST_UNREACHABLE, None).await;
                }
            }
            return;
        }
    }

    let upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(%peer, %target, error = %e, "socks dial failed");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_connect")]);
            let _ = write_reply(&mut stream, REP_HOST_UNREACHABLE, None).await;
            return;
        }
        Err(_) => {
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_connect")]);
            let _ = write_reply(&mut stream, REP_HOST_UNREACHABLE, None).await;
            return;
        }
    };

    let bound = upstream.local_addr().ok();
    if write_reply(&mut stream, REP_SUCCESS, bound).await.is_err() {
        return;
    }

    let conn = state.begin_user_connection(&user.username);
    let speed = if bypass { 0 } else { user.bandwidth_speed_mbps };
    let started = Instant::now();
    let counts = relay(
        ThrottledStream::new(stream, speed),
        ThrottledStream::new(upstream, speed),
        state.session_cancel.clone(),
        state.config.idle_timeout(),
    )
    .await;
    drop(conn);

    state.tracker.record(&user.username, counts.a_to_b, counts.b_to_a);
    state
        .metrics
        .relay_bytes_total
        .add(counts.a_to_b, &[KeyValue::new("direction", "up")]);
    state
        .metrics
        .relay_bytes_total
        .add(counts.b_to_a, &[KeyValue::new("direction", "down")]);
    state
        .metrics
        .relay_duration_seconds
        .record(started.elapsed().as_secs_f64(), &[]);
    debug!(%peer, %target, user = %user.username, up = counts.a_to_b, down = counts.b_to_a, "socks session closed");
}

/// Method negotiation, user/pass sub-negotiation, and request parsing.
/// Protocol errors send a best-effort reply and yield `None`.
async fn negotiate(
    state: &Arc<ProxyState>,
    stream: &mut TcpStream,
    client_ip: IpAddr,
) -> Option<Negotiated> {
    // METHOD_WAIT: version + offered method list
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.ok()?;
    if head[0] != SOCKS_VERSION || head[1] == 0 {
        return None;
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await.ok()?;

    // No-auth is honored only for clients inside the super-admin ranges;
    // everyone else must offer user/pass.
    let super_admin = state.identity.super_admin_for(client_ip);
    let (user, bypass) = if methods.contains(&METHOD_NO_AUTH) && super_admin.is_some() {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NO_AUTH])
            .await
            .ok()?;
        (super_admin?, true)
    } else if methods.contains(&METHOD_USER_PASS) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_USER_PASS])
            .await
            .ok()?;
        // AUTH_WAIT: RFC 1929 sub-negotiation
        let mut auth_head = [0u8; 2];
        stream.read_exact(&mut auth_head).await.ok()?;
        if auth_head[0] != AUTH_VERSION {
            return None;
        }
        let mut username = vec![0u8; auth_head[1] as usize];
        stream.read_exact(&mut username).await.ok()?;
        let mut pass_len = [0u8; 1];
        stream.read_exact(&mut pass_len).await.ok()?;
        let mut password = vec![0u8; pass_len[0] as usize];
        stream.read_exact(&mut password).await.ok()?;

        let username = String::from_utf8(username).ok()?;
        let password = String::from_utf8(password).ok()?;
        match state.identity.validate(&username, &password) {
            Some(user) => {
                stream.write_all(&[AUTH_VERSION, 0x00]).await.ok()?;
                (user, false)
            }
            None => {
                state
                    .metrics
                    .auth_failures_total
                    .add(1, &[KeyValue::new("type", "invalid_credentials")]);
                let _ = stream.write_all(&[AUTH_VERSION, 0x01]).await;
                return None;
            }
        }
    } else {
        let _ = stream
            .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
            .await;
        return None;
    };

    // REQUEST_WAIT: version, command, reserved, address type
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await.ok()?;
    if req[0] != SOCKS_VERSION {
        return None;
    }
    if req[1] != CMD_CONNECT {
        let _ = write_reply(stream, REP_COMMAND_NOT_SUPPORTED, None).await;
        return None;
    }
    let host = match req[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await.ok()?;
            IpAddr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.ok()?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await.ok()?;
            String::from_utf8(name).ok()?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await.ok()?;
            format!("[{}]", IpAddr::from(addr))
        }
        _ => {
            let _ = write_reply(stream, REP_COMMAND_NOT_SUPPORTED, None).await;
            return None;
        }
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await.ok()?;
    let port = u16::from_be_bytes(port);

    Some(Negotiated { user, bypass, target: format!("{host}:{port}") })
}

/// Reply framing: version, code, reserved, then the bound address (the
/// local side of the upstream socket on success, zeros otherwise).
async fn write_reply(
    stream: &mut TcpStream,
    code: u8,
    bound: Option<SocketAddr>,
) -> std::io::Result<()> {
    let mut reply = vec![SOCKS_VERSION, code, 0x00];
    match bound {
        Some(SocketAddr::V4(v4)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&v4.ip().octets());
            reply.extend_from_slice(&v4.port().to_be_bytes());
        }
        Some(SocketAddr::V6(v6)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&v6.ip().octets());
            reply.extend_from_slice(&v6.port().to_be_bytes());
        }
        None => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&reply).await
}
