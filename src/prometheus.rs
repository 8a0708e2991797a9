//! Prometheus http exporter

use std::process;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::future::Shared;
use futures::Future;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::info;
use once_cell::sync::OnceCell;
use prometheus::{
    self, register_gauge, register_int_counter_vec, register_int_gauge_vec, Encoder, Gauge,
    IntCounterVec, IntGaugeVec, TextEncoder,
};
use tokio::sync::watch;

use crate::connection::{ConnectionState, Connections};
use crate::traffic::{Resource, TrafficControl};
use crate::watchtower::WatchOutcome;

static START: OnceCell<Instant> = OnceCell::new();
static UPTIME: OnceCell<Gauge> = OnceCell::new();

static DISCONNECT_VOTES: OnceCell<IntGaugeVec> = OnceCell::new();
static SHOULD_CONNECT: OnceCell<IntGaugeVec> = OnceCell::new();
static CONNECTION_STATE: OnceCell<IntGaugeVec> = OnceCell::new();
static WATCH_OUTCOMES: OnceCell<IntCounterVec> = OnceCell::new();

/// Updates the gauges of one traffic control gate. A no-op until the exporter started.
pub fn record_traffic(resource: Resource, control: &TrafficControl) {
    if let Some(g) = DISCONNECT_VOTES.get() {
        g.with_label_values(&[resource.as_str()])
            .set(control.disconnect_votes as i64);
    }
    if let Some(g) = SHOULD_CONNECT.get() {
        g.with_label_values(&[resource.as_str()])
            .set(control.should_connect() as i64);
    }
}

pub fn record_connections(connections: &Connections) {
    if let Some(g) = CONNECTION_STATE.get() {
        for (name, state) in [
            ("peer", connections.peer),
            ("electrum", connections.electrum),
            ("internet", connections.internet),
            ("global", connections.global),
        ] {
            g.with_label_values(&[name]).set(state.as_i64());
        }
    }
}

pub fn record_watch_outcome(outcome: &WatchOutcome) {
    if let Some(c) = WATCH_OUTCOMES.get() {
        c.with_label_values(&[outcome.label()]).inc();
    }
}

fn health(connections: &Connections) -> &'static str {
    match connections.global {
        ConnectionState::Established => "OK",
        ConnectionState::Establishing => "CONNECTING",
        ConnectionState::Closed => "DISCONNECTED",
    }
}

async fn response_examples(
    connections: watch::Receiver<Connections>,
    req: Request<Body>,
) -> hyper::Result<Response<Body>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let current = *connections.borrow();
            Ok(Response::new(Body::from(health(&current))))
        }
        (&Method::GET, "/pid") => Ok(Response::new(Body::from(process::id().to_string()))),
        (&Method::GET, "/metrics") => {
            if let (Some(g), Some(start)) = (UPTIME.get(), START.get()) {
                g.set(start.elapsed().as_millis() as f64);
            }
            let metric_families = prometheus::gather();
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                return Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::from(e.to_string()))
                    .unwrap_or_default());
            }
            Ok(Response::new(Body::from(buffer)))
        }
        _ => Ok(not_found()),
    }
}

static NOTFOUND: &[u8] = b"Not Found";
/// HTTP status code 404
fn not_found() -> Response<Body> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(NOTFOUND.into())
        .unwrap_or_default()
}

/// Registers the metrics. Safe to call more than once.
pub fn register_metrics() -> Result<()> {
    START.get_or_init(Instant::now);
    UPTIME.get_or_try_init(|| {
        register_gauge!(
            "sentinel_uptime",
            "Time in milliseconds how long the sentinel is running"
        )
    })?;
    DISCONNECT_VOTES.get_or_try_init(|| {
        register_int_gauge_vec!(
            "sentinel_disconnect_votes",
            "Net disconnect votes held on a resource",
            &["resource"]
        )
    })?;
    SHOULD_CONNECT.get_or_try_init(|| {
        register_int_gauge_vec!(
            "sentinel_should_connect",
            "1 when the resource is allowed to connect",
            &["resource"]
        )
    })?;
    CONNECTION_STATE.get_or_try_init(|| {
        register_int_gauge_vec!(
            "sentinel_connection_state",
            "0 closed, 1 establishing, 2 established",
            &["resource"]
        )
    })?;
    WATCH_OUTCOMES.get_or_try_init(|| {
        register_int_counter_vec!(
            "sentinel_watch_outcomes_total",
            "Watchtower runs by outcome",
            &["outcome"]
        )
    })?;
    Ok(())
}

/// Starts an prometheus exporter backend
pub async fn start_prometheus_exporter(
    address: String,
    connections: watch::Receiver<Connections>,
    quit_signal: Shared<impl Future<Output = ()>>,
) -> Result<()> {
    register_metrics()?;
    record_connections(&connections.borrow());

    let addr = address.parse().context("Failed to parse exporter")?;
    let make_service = make_service_fn(move |_| {
        let connections_clone = connections.clone();
        let service =
            service_fn(move |req| response_examples(connections_clone.clone(), req));
        async move { Ok::<_, hyper::Error>(service) }
    });

    let server = Server::bind(&addr)
        .serve(make_service)
        .with_graceful_shutdown(quit_signal);

    info!("Prometheus exporter listening on http://{}", addr);

    server.await.context("Failed to start server")
}
