//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Metrics collection and export utilities."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Prometheus registry and the `/metrics` exporter for the governor daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{IntCounter, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

mod energy;

pub use energy::{EnergyMetrics, MetricsReporter};

/// Shared registry type used across services.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Serve the registry at `/metrics` until `shutdown` fires.
pub async fn spawn_exporter(
    registry: SharedRegistry,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<MetricsExporter> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let bound = listener
        .local_addr()
        .context("failed to read metrics listener address")?;
    let app = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(registry);

    info!(address = %bound, "metrics exporter listening");
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await
            .context("metrics exporter failed")
    });
    Ok(MetricsExporter { addr: bound, task })
}

async fn render_metrics(State(registry): State<SharedRegistry>) -> Response {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Running `/metrics` exporter.
#[derive(Debug)]
pub struct MetricsExporter {
    addr: SocketAddr,
    task: JoinHandle<Result<()>>,
}

impl MetricsExporter {
    /// Bound address, with the resolved port when bound to port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the exporter to finish after shutdown was signalled.
    pub async fn stopped(self) -> Result<()> {
        self.task.await.context("metrics exporter task panicked")?
    }
}

/// Counts daemon starts so restarts show up as counter increments.
#[derive(Clone)]
pub struct DaemonMetrics {
    starts_total: IntCounter,
}

impl DaemonMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let starts_total = IntCounter::new(
            "evbd_starts_total",
            "Total number of times the governor daemon has initialised",
        )?;
        registry.register(Box::new(starts_total.clone()))?;
        Ok(Self { starts_total })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }
}

pub use prometheus;
