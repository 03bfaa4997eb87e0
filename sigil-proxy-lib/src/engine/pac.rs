use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use http::{header, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};

use crate::auth::IdentityStore;
use crate::config::PacOptions;
use crate::engine::http::{status_response, RespBody};

const PAC_PATH: &str = "/proxy.pac";
const CACHE_SECS: u64 = 300;
const WINDOW: Duration = Duration::from_secs(60);

struct MinuteWindow {
    start: Instant,
    count: u32,
}

/// Serves a generated proxy-auto-config script.
///
/// Optional token gate, optional credential embedding, and a per-client-IP
/// minute-window rate limit.
pub struct PacResponder {
    options: PacOptions,
    identity: Arc<IdentityStore>,
    proxy_port: u16,
    windows: Mutex<AHashMap<IpAddr, MinuteWindow>>,
}

impl PacResponder {
    pub fn new(options: PacOptions, identity: Arc<IdentityStore>, proxy_port: u16) -> Self {
        Self { options, identity, proxy_port, windows: Mutex::new(AHashMap::new()) }
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn path(&self) -> &'static str {
        PAC_PATH
    }

    pub fn handle(&self, client_ip: IpAddr, req: &Request<Incoming>) -> Response<RespBody> {
        if req.method() != http::Method::GET {
            return status_response(StatusCode::METHOD_NOT_ALLOWED);
        }
        if !self.allow(client_ip) {
            return status_response(StatusCode::TOO_MANY_REQUESTS);
        }

        let params = parse_query(req.uri().query().unwrap_or(""));

        if let Some(required) = &self.options.token {
            if params.get("token") != Some(required) {
                return status_response(StatusCode::FORBIDDEN);
            }
        }

        let user = match params
            .get("user")
            .cloned()
            .or_else(|| self.options.default_user.clone())
        {
            Some(u) => u,
            None => return status_response(StatusCode::BAD_REQUEST),
        };

        // Credentials go into the script only after a successful validation;
        // without a password the browser negotiates them itself.
        let credentials = match params.get("pass") {
            Some(pass) => {
                if self.identity.validate(&user, pass).is_none() {
                    return status_response(StatusCode::FORBIDDEN);
                }
                Some(format!("{user}:{pass}"))
            }
            None => None,
        };

        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.rsplit_once(':').map_or(h, |(host, _)| host))
            .unwrap_or("127.0.0.1");
        let endpoint = match credentials {
            Some(creds) => format!("{creds}@{host}:{}", self.proxy_port),
            None => format!("{host}:{}", self.proxy_port),
        };

        let script = format!(
            "function FindProxyForURL(url, host) {{\n    return \"PROXY {endpoint}\";\n}}\n"
        );

        let body = Full::new(Bytes::from(script))
            .map_err(|never| match never {})
            .boxed();
        let mut resp = Response::new(body);
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/x-ns-proxy-autoconfig"),
        );
        if let Ok(value) = http::HeaderValue::from_str(&format!("max-age={CACHE_SECS}")) {
            resp.headers_mut().insert(header::CACHE_CONTROL, value);
        }
        resp
    }

    /// Minute-window counter per client IP; 0 rpm disables the limit.
    fn allow(&self, ip: IpAddr) -> bool {
        if self.options.rate_limit_rpm == 0 {
            return true;
        }
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows
            .entry(ip)
            .or_insert(MinuteWindow { start: now, count: 0 });
        if now.duration_since(window.start) >= WINDOW {
            window.start = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= self.options.rate_limit_rpm
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
