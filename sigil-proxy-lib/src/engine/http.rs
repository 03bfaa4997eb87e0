use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Frame, Incoming, SizeHint};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use opentelemetry::KeyValue;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::auth::User;
use crate::engine::pac::PacResponder;
use crate::engine::{Engine, PolicyRejection, ProxyState, SessionPermit, UserConnection};
use crate::error::{ProxyError, Result};
use crate::limit::ThrottledStream;
use crate::relay::relay;
use crate::tls::{build_server_config, ReloadingCertResolver};

pub(crate) type RespBody = BoxBody<Bytes, hyper::Error>;
type ForwardClient = Client<HttpConnector, Incoming>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const AUTH_REALM: &str = "sigil-proxy";

/// Headers that must not travel past a single hop, plus the proxy's own
/// credential header.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Authenticated forward proxy: CONNECT tunnels plus absolute-form
/// requests, on a plaintext listener and optionally a TLS one.
pub struct HttpProxyEngine {
    state: Arc<ProxyState>,
    tls: Option<TlsAcceptor>,
    client: ForwardClient,
    pac: Arc<PacResponder>,
}

impl HttpProxyEngine {
    pub fn new(state: Arc<ProxyState>, resolver: Option<Arc<ReloadingCertResolver>>) -> Self {
        let tls = resolver.map(|r| TlsAcceptor::from(Arc::new(build_server_config(r))));
        let pac = Arc::new(PacResponder::new(
            state.env.pac.clone(),
            state.identity.clone(),
            state.env.http_proxy_port,
        ));
        Self { state, tls, client: build_forward_client(), pac }
    }
}

/// One pooled client shared by every forward request.
fn build_forward_client() -> ForwardClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    connector.set_keepalive(Some(KEEPALIVE_TIME));
    Client::builder(TokioExecutor::new())
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(connector)
}

#[async_trait]
impl Engine for HttpProxyEngine {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let plain_addr = SocketAddr::from(([0, 0, 0, 0], self.state.env.http_proxy_port));
        let plain = TcpListener::bind(plain_addr)
            .await
            .map_err(|e| ProxyError::Config(format!("http listener bind failed: {e}")))?;
        info!(addr = %plain_addr, "http proxy listener bound");

        match &self.tls {
            Some(acceptor) => {
                let tls_addr = SocketAddr::from(([0, 0, 0, 0], self.state.env.http_proxy_tls_port));
                let tls_listener = TcpListener::bind(tls_addr)
                    .await
                    .map_err(|e| ProxyError::Config(format!("https listener bind failed: {e}")))?;
                info!(addr = %tls_addr, "https proxy listener bound");
                tokio::join!(
                    self.accept_loop(plain, None, shutdown.clone()),
                    self.accept_loop(tls_listener, Some(acceptor.clone()), shutdown),
                );
            }
            None => self.accept_loop(plain, None, shutdown).await,
        }
        Ok(())
    }
}

impl HttpProxyEngine {
    async fn accept_loop(
        &self,
        listener: TcpListener,
        acceptor: Option<TlsAcceptor>,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                r = listener.accept() => r,
                _ = shutdown.cancelled() => {
                    info!("http listener closing");
                    return;
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
            set_keepalive(&stream);
            let state = self.state.clone();
            let client = self.client.clone();
            let pac = self.pac.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                serve_proxy_connection(state, client, pac, acceptor, stream, peer, permit).await;
            });
        }
    }
}

async fn serve_proxy_connection(
    state: Arc<ProxyState>,
    client: ForwardClient,
    pac: Arc<PacResponder>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
    peer: SocketAddr,
    permit: SessionPermit,
) {
    let _permit = permit;
    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let client = client.clone();
        let pac = pac.clone();
        async move {
            let response = handle_request(state.clone(), client, pac, peer, req).await;
            state.metrics.requests_total.add(
                1,
                &[KeyValue::new("status_code", response.status().as_u16().to_string())],
            );
            Ok::<_, std::convert::Infallible>(response)
        }
    });

    // Tunnels are long-lived; the server applies no per-connection deadline.
    let builder = ConnBuilder::new(TokioExecutor::new());
    match acceptor {
        Some(tls) => match timeout(TLS_HANDSHAKE_TIMEOUT, tls.accept(stream)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = builder
                    .serve_connection_with_upgrades(TokioIo::new(stream), svc)
                    .await
                {
                    debug!(%peer, error = %e, "connection ended with error");
                }
            }
            Ok(Err(e)) => warn!(%peer, error = %e, "tls handshake failed"),
            Err(_) => warn!(%peer, "tls handshake timeout"),
        },
        None => {
            if let Err(e) = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), svc)
                .await
            {
                debug!(%peer, error = %e, "connection ended with error");
            }
        }
    }
}

async fn handle_request(
    state: Arc<ProxyState>,
    client: ForwardClient,
    pac: Arc<PacResponder>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<RespBody> {
    let ip = peer.ip();

    // PAC requests arrive in origin-form, everything proxied is CONNECT or
    // absolute-form.
    if pac.enabled()
        && req.method() == Method::GET
        && req.uri().scheme().is_none()
        && req.uri().path() == pac.path()
    {
        return pac.handle(ip, &req);
    }

    if !state.identity.client_allowed(ip) {
        state
            .metrics
            .errors_total
            .add(1, &[KeyValue::new("type", "client_forbidden")]);
        return status_response(StatusCode::FORBIDDEN);
    }

    let Some((username, password)) = basic_credentials(req.headers()) else {
        state
            .metrics
            .auth_failures_total
            .add(1, &[KeyValue::new("type", "missing_credentials")]);
        return proxy_auth_required();
    };
    let Some(user) = state.identity.validate(&username, &password) else {
        state
            .metrics
            .auth_failures_total
            .add(1, &[KeyValue::new("type", "invalid_credentials")]);
        return proxy_auth_required();
    };

    if let Some(rejection) = state.check_user_policy(&user, ip) {
        return match rejection {
            PolicyRejection::RateLimited => {
                state
                    .metrics
                    .rate_limited_total
                    .add(1, &[KeyValue::new("user", user.username.clone())]);
                status_response(StatusCode::TOO_MANY_REQUESTS)
            }
            PolicyRejection::Expired => {
                state
                    .metrics
                    .errors_total
                    .add(1, &[KeyValue::new("type", "account_expired")]);
                status_response(StatusCode::FORBIDDEN)
            }
            PolicyRejection::BandwidthExceeded => {
                state
                    .metrics
                    .errors_total
                    .add(1, &[KeyValue::new("type", "bandwidth_exceeded")]);
                status_response(StatusCode::FORBIDDEN)
            }
            PolicyRejection::TooManyConnections => {
                state
                    .metrics
                    .errors_total
                    .add(1, &[KeyValue::new("type", "connection_limit")]);
                status_response(StatusCode::TOO_MANY_REQUESTS)
            }
        };
    }

    let bypass = user.is_super_admin() && state.identity.catalog().is_super_admin_ip(ip);
    let speed = if bypass { 0 } else { user.bandwidth_speed_mbps };

    if req.method() == Method::CONNECT {
        handle_connect(state, user, speed, req).await
    } else {
        handle_forward(state, client, user, req).await
    }
}

/// CONNECT: dial, then hand the hijacked client stream to the relay.
async fn handle_connect(
    state: Arc<ProxyState>,
    user: Arc<User>,
    speed_mbps: u64,
    req: Request<Incoming>,
) -> Response<RespBody> {
    let Some(target) = connect_target(&req) else {
        return status_response(StatusCode::BAD_REQUEST);
    };

    let upstream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            warn!(%target, error = %e, "connect dial failed");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_connect")]);
            return status_response(StatusCode::BAD_GATEWAY);
        }
        Err(_) => {
            warn!(%target, "connect dial timeout");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_connect")]);
            return status_response(StatusCode::BAD_GATEWAY);
        }
    };
    set_keepalive(&upstream);

    let conn = state.begin_user_connection(&user.username);
    let upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        let client_io = match upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                warn!(error = %e, "connect upgrade failed");
                drop(conn);
                return;
            }
        };
        let started = Instant::now();
        let counts = relay(
            ThrottledStream::new(client_io, speed_mbps),
            ThrottledStream::new(upstream, speed_mbps),
            state.session_cancel.clone(),
            state.config.idle_timeout(),
        )
        .await;
        // The session leaves the active set before its totals are reported.
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
        debug!(%target, user = %user.username, up = counts.a_to_b, down = counts.b_to_a, "tunnel closed");
    });

    status_response(StatusCode::OK)
}

/// Plain verbs: require absolute-form, strip hop-by-hop headers, forward
/// through the pooled client and meter the streamed response.
async fn handle_forward(
    state: Arc<ProxyState>,
    client: ForwardClient,
    user: Arc<User>,
    mut req: Request<Incoming>,
) -> Response<RespBody> {
    if req.uri().scheme().is_none() {
        return status_response(StatusCode::BAD_REQUEST);
    }
    strip_hop_by_hop(req.headers_mut());

    let conn = state.begin_user_connection(&user.username);
    match client.request(req).await {
        Ok(resp) => {
            let (parts, body) = resp.into_parts();
            let metered = MeteredBody {
                inner: body,
                state: state.clone(),
                username: user.username.clone(),
                bytes: 0,
                conn: Some(conn),
            };
            Response::from_parts(parts, metered.boxed())
        }
        Err(e) => {
            warn!(error = %e, "forward request failed");
            state
                .metrics
                .errors_total
                .add(1, &[KeyValue::new("type", "upstream_request")]);
            status_response(StatusCode::BAD_GATEWAY)
        }
    }
}

/// Streams the upstream response through while counting payload bytes;
/// reports them as downstream usage when the body finishes.
struct MeteredBody {
    inner: Incoming,
    state: Arc<ProxyState>,
    username: String,
    bytes: u64,
    conn: Option<UserConnection>,
}

impl hyper::body::Body for MeteredBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.len() as u64;
                }
                Poll::Ready(Some(Ok(frame)))
            }
            other => other,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for MeteredBody {
    fn drop(&mut self) {
        // The connection leaves the active set before its totals are
        // reported.
        self.conn.take();
        if self.bytes > 0 {
            self.state.tracker.record(&self.username, 0, self.bytes);
            self.state
                .metrics
                .relay_bytes_total
                .add(self.bytes, &[KeyValue::new("direction", "down")]);
        }
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::PROXY_AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn connect_target(req: &Request<Incoming>) -> Option<String> {
    let authority = req.uri().authority()?;
    Some(if authority.port().is_some() {
        authority.to_string()
    } else {
        format!("{}:443", authority.host())
    })
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn set_keepalive(stream: &TcpStream) {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    let _ = socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive);
}

pub(crate) fn empty_body() -> RespBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn status_response(status: StatusCode) -> Response<RespBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

fn proxy_auth_required() -> Response<RespBody> {
    let mut resp = status_response(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    let challenge = format!("Basic realm=\"{AUTH_REALM}\"");
    if let Ok(value) = http::HeaderValue::from_str(&challenge) {
        resp.headers_mut().insert(header::PROXY_AUTHENTICATE, value);
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_credentials_decode() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::PROXY_AUTHORIZATION,
            http::HeaderValue::from_static("Basic YWxpY2U6cHc="),
        );
        assert_eq!(
            basic_credentials(&headers),
            Some(("alice".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn missing_or_malformed_credentials() {
        assert_eq!(basic_credentials(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::PROXY_AUTHORIZATION,
            http::HeaderValue::from_static("Bearer abc"),
        );
        assert_eq!(basic_credentials(&headers), None);
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, http::HeaderValue::from_static("close"));
        headers.insert(
            header::PROXY_AUTHORIZATION,
            http::HeaderValue::from_static("Basic x"),
        );
        headers.insert(header::ACCEPT, http::HeaderValue::from_static("*/*"));
        strip_hop_by_hop(&mut headers);
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get(header::PROXY_AUTHORIZATION).is_none());
        assert!(headers.get(header::ACCEPT).is_some());
    }
}
