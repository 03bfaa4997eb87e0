use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Engine, ProxyState, SessionPermit};
use crate::error::{ProxyError, Result};
use crate::relay::relay;
use crate::sni;
use crate::tls::{build_server_config, ReloadingCertResolver};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PEEK_BUFFER: usize = 16 * 1024;

/// SNI-routed TLS tunnel listener.
///
/// Terminates an outer TLS session, reads the first decrypted bytes (the
/// inner ClientHello a client sends through the tunnel), routes by SNI
/// against the configured allow-list, and relays opaquely from there.
pub struct SignalEngine {
    state: Arc<ProxyState>,
    tls: TlsAcceptor,
}

impl SignalEngine {
    pub fn new(state: Arc<ProxyState>, resolver: Arc<ReloadingCertResolver>) -> Self {
        let tls = TlsAcceptor::from(Arc::new(build_server_config(resolver)));
        Self { state, tls }
    }
}

#[async_trait]
impl Engine for SignalEngine {
    fn name(&self) -> &'static str {
        "signal"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.state.config.listen)
            .await
            .map_err(|e| ProxyError::Config(format!("signal listener bind failed: {e}")))?;
        info!(addr = %self.state.config.listen, "signal tunnel listener bound");

        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = shutdown.cancelled() => {
                    info!("signal listener closing");
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
            let tls = self.tls.clone();
            tokio::spawn(async move {
                handle_tunnel(state, tls, stream, peer, permit).await;
            });
        }
    }
}

async fn handle_tunnel(
    state: Arc<ProxyState>,
    tls: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    permit: SessionPermit,
) {
    let _permit = permit;
    let started = Instant::now();

    let mut client = match timeout(HANDSHAKE_TIMEOUT, tls.accept(stream)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(%peer, error = %e, "tls handshake failed");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "tls_handshake")]);
            return;
        }
        Err(_) => {
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "handshake_timeout")]);
            return;
        }
    };

    // First decrypted bytes: the inner ClientHello the client tunnels.
    let mut peeked = vec![0u8; PEEK_BUFFER];
    let n = match timeout(HANDSHAKE_TIMEOUT, client.read(&mut peeked)).await {
        Ok(Ok(n)) if n > 0 => n,
        Ok(_) => {
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "empty_payload")]);
            return;
        }
        Err(_) => {
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "peek_timeout")]);
            return;
        }
    };
    peeked.truncate(n);

    if !sni::is_tls_handshake(&peeked) {
        // The tunnel port only speaks TLS-in-TLS; operational endpoints
        // live on the metrics listener.
        state
            .metrics
            .errors_total
            .add(1, &[KeyValue::new("type", "non_tls_payload")]);
        return;
    }

    let sni = match sni::extract_sni(&peeked) {
        Some(name) => name.to_ascii_lowercase(),
        None => {
            warn!(%peer, "unauthorized sni: none present");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "unauthorized_sni")]);
            return;
        }
    };
    let Some(upstream_addr) = state.config.upstream_for_sni(&sni).map(str::to_owned) else {
        warn!(%peer, %sni, "unauthorized sni");
        state
            .metrics
            .errors_total
            .add(1, &[KeyValue::new("type", "unauthorized_sni")]);
        return;
    };

    let mut upstream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&upstream_addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(%peer, %sni, upstream = %upstream_addr, error = %e, "upstream dial failed");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_connect")]);
            return;
        }
        Err(_) => {
            warn!(%peer, %sni, upstream = %upstream_addr, "upstream dial timeout");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_connect")]);
            return;
        }
    };

    // Replay the inner ClientHello before relaying.
    if let Err(e) = upstream.write_all(&peeked).await {
        warn!(%peer, %sni, error = %e, "failed to replay peeked bytes");
        state
            .metrics
            .errors_total
            .add(1, &[KeyValue::new("type", "upstream_write")]);
        return;
    }

    let counts = relay(
        client,
        upstream,
        state.session_cancel.clone(),
        state.config.idle_timeout(),
    )
    .await;

    let sni_label = KeyValue::new("sni", sni.clone());
    state.metrics.relay_total.add(1, &[sni_label.clone()]);
    state.metrics.relay_bytes_total.add(
        counts.a_to_b,
        &[sni_label.clone(), KeyValue::new("direction", "up")],
    );
    state.metrics.relay_bytes_total.add(
        counts.b_to_a,
        &[sni_label.clone(), KeyValue::new("direction", "down")],
    );
    state
        .metrics
        .relay_duration_seconds
        .record(started.elapsed().as_secs_f64(), &[sni_label]);

    info!(%peer, %sni, up = counts.a_to_b, down = counts.b_to_a, "tunnel closed");
}
