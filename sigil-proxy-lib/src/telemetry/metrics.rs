use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The instrument set the data-plane engines report into.
#[derive(Clone)]
pub struct Metrics {
    pub connections_total: Counter<u64>,
    pub connections_active: UpDownCounter<i64>,
    pub connections_rejected_total: Counter<u64>,

    pub relay_total: Counter<u64>,
    pub relay_bytes_total: Counter<u64>,
    pub relay_duration_seconds: Histogram<f64>,

    pub requests_total: Counter<u64>,
    pub auth_failures_total: Counter<u64>,
    pub rate_limited_total: Counter<u64>,
    pub errors_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: Meter) -> Self {
        Self {
            connections_total: meter
                .u64_counter("sigil_connections_total")
                .with_description("Total number of connections accepted")
                .build(),
            connections_active: meter
                .i64_up_down_counter("sigil_connections_active")
                .with_description("Number of active connections")
                .build(),
            connections_rejected_total: meter
                .u64_counter("sigil_connections_rejected_total")
                .with_description("Connections rejected by admission control")
                .build(),

            relay_total: meter
                .u64_counter("sigil_relay_total")
                .with_description("Completed relay sessions")
                .build(),
            relay_bytes_total: meter
                .u64_counter("sigil_relay_bytes_total")
                .with_description("Bytes relayed, labeled by direction")
                .build(),
            relay_duration_seconds: meter
                .f64_histogram("sigil_relay_duration_seconds")
                .with_description("Relay session duration in seconds")
                .build(),

            requests_total: meter
                .u64_counter("sigil_requests_total")
                .with_description("HTTP proxy requests processed, labeled by status code")
                .build(),
            auth_failures_total: meter
                .u64_counter("sigil_auth_failures_total")
                .with_description("Authentication failures, labeled by type")
                .build(),
            rate_limited_total: meter
                .u64_counter("sigil_rate_limited_total")
                .with_description("Requests rejected by the per-user rate limiter")
                .build(),
            errors_total: meter
                .u64_counter("sigil_errors_total")
                .with_description("Errors, labeled by type")
                .build(),
        }
    }
}

pub fn init_metrics() -> Result<(Arc<Metrics>, Registry), Box<dyn std::error::Error + Send + Sync>>
{
    let registry = Registry::default();

    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;

    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();

    global::set_meter_provider(meter_provider);

    let meter = global::meter("sigil-proxy");
    let metrics = Arc::new(Metrics::new(meter));

    Ok((metrics, registry))
}

/// Render every registered instrument in Prometheus text exposition format.
fn scrape_response(registry: &Registry) -> std::io::Result<Response<Full<Bytes>>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| std::io::Error::other(format!("metrics encoding failed: {e}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .map_err(|e| std::io::Error::other(format!("metrics response failed: {e}")))
}

/// Serve the Prometheus scrape endpoint until cancelled.
pub async fn serve_metrics(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "metrics listener bound");
    let registry = Arc::new(registry);

    loop {
        let accepted = tokio::select! {
            r = listener.accept() => r,
            _ = cancel.cancelled() => return Ok(()),
        };
        let (stream, _peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "metrics accept failed");
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |_req| {
                let registry = registry.clone();
                async move { scrape_response(&registry) }
            });
            if let Err(e) = ConnBuilder::new(hyper_util::rt::TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), svc)
                .await
            {
                warn!(error = %e, "metrics connection error");
            }
        });
    }
}
