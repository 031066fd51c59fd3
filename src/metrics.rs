use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::env;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "rust_loadharness".to_string());

    // === Client Metrics ===

    pub static ref REQUESTS_SENT: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_sent_total", "Total number of request keys sent to a frontend")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_OUTCOMES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("request_outcomes_total", "Resolved requests by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // success, late, timeout
        ).unwrap();

    pub static ref OUTSTANDING_REQUESTS: IntGauge =
        IntGauge::with_opts(
            Opts::new("outstanding_requests", "Entries currently held in the correlation index")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref LEASE_RENEWALS: IntCounterVec =
        IntCounterVec::new(
            Opts::new("lease_renewals_total", "Lease renewal attempts by result")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["result"]  // granted, timeout, rejected
        ).unwrap();

    // === Shared Metrics ===

    pub static ref PACER_TIMEOUT_MS: GaugeVec =
        GaugeVec::new(
            Opts::new("pacer_timeout_milliseconds", "Current adaptive timeout")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["role"]  // client, frontend
        ).unwrap();

    pub static ref CONTROL_SIGNALS: IntCounterVec =
        IntCounterVec::new(
            Opts::new("control_signals_total", "Control datagrams received")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["signal"]
        ).unwrap();

    pub static ref UNKNOWN_DATAGRAMS: IntCounter =
        IntCounter::with_opts(
            Opts::new("unknown_datagrams_total", "Datagrams that matched no handler")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Frontend Metrics ===

    pub static ref PROXY_OUTCOMES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("proxy_outcomes_total", "Proxied backend calls by outcome")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["outcome"]  // forwarded, rejected, timeout, backend_error, dropped
        ).unwrap();

    pub static ref BACKEND_ERRORS_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("backend_errors_total", "Failed backend calls by category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let registry = prometheus::default_registry();

    registry.register(Box::new(REQUESTS_SENT.clone()))?;
    registry.register(Box::new(REQUEST_OUTCOMES.clone()))?;
    registry.register(Box::new(OUTSTANDING_REQUESTS.clone()))?;
    registry.register(Box::new(LEASE_RENEWALS.clone()))?;

    registry.register(Box::new(PACER_TIMEOUT_MS.clone()))?;
    registry.register(Box::new(CONTROL_SIGNALS.clone()))?;
    registry.register(Box::new(UNKNOWN_DATAGRAMS.clone()))?;

    registry.register(Box::new(PROXY_OUTCOMES.clone()))?;
    registry.register(Box::new(BACKEND_ERRORS_BY_CATEGORY.clone()))?;

    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Registry,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    let response = match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", encoder.format_type())
            .body(Body::from(buffer)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
        }
    };

    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Registry) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry = registry.clone();
                async move { metrics_handler(req, registry).await }
            }))
        }
    });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(
        port = port,
        addr = %addr,
        "Metrics server listening"
    );

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

/// Gathers and encodes metrics as a string for final output.
pub fn gather_metrics_string(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return format!("# ERROR ENCODING METRICS: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# ERROR ENCODING METRICS TO UTF-8"))
}
