//! Core shared utilities for the tree-ensemble coordinator: tracing setup,
//! layered configuration, the health endpoint and the federated learning
//! primitives.

use anyhow::{bail, Result};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use once_cell::sync::OnceCell;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod federated_learning;
mod metrics_ext;

pub use federated_learning::{
    aggregate_bagging, AggregatedEnsemble, BaggingAggregator, EnsembleModel, GlobalModelManager, PayloadError,
    WeightPayload,
};
pub use metrics_ext::{coordinator_metrics, CoordinatorMetrics, COORDINATOR_METRICS};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static METRICS_REGISTRY: OnceCell<prometheus::Registry> = OnceCell::new();
static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }

/// Installs the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `TREEFED_JSON_LOG=1|true` switches the output to flattened JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
        let json = std::env::var("TREEFED_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true).with_thread_ids(false).with_line_number(true))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "treefed", service, "tracing_initialized");
    Ok(())
}

/// Installs the global meter provider backed by a Prometheus registry.
/// Instruments created before this call stay no-ops, so run it first.
pub fn init_metrics() -> Result<()> {
    METRICS_REGISTRY.get_or_try_init(|| -> Result<prometheus::Registry> {
        let registry = prometheus::Registry::new();
        let exporter = opentelemetry_prometheus::exporter().with_registry(registry.clone()).build()?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        opentelemetry::global::set_meter_provider(provider);
        info!("metrics_exporter_installed");
        Ok(registry)
    })?;
    Ok(())
}

/// Prometheus text exposition of everything recorded so far. `None` until
/// [`init_metrics`] has run.
pub fn render_metrics() -> Result<Option<String>> {
    let Some(registry) = METRICS_REGISTRY.get() else { return Ok(None) };
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    Ok(Some(String::from_utf8(buf)?))
}

async fn metrics_handler() -> Response {
    match render_metrics() {
        Ok(Some(text)) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Ok(None) => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("encode error: {e}")).into_response(),
    }
}

/// Snapshot producer for the `/status` route.
pub type StatusProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

pub async fn start_health_server(port: u16, status: StatusProvider) -> Result<()> {
    let app = Router::new()
        .route("/live", get(|| async { Json(serde_json::json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { Json(serde_json::json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/metrics", get(metrics_handler))
        .route(
            "/status",
            get(move || {
                let status = status.clone();
                async move {
                    Json(serde_json::json!({
                        "live": NODE_LIVENESS.load(Ordering::SeqCst),
                        "ready": NODE_READINESS.load(Ordering::SeqCst),
                        "coordinator": status(),
                    }))
                }
            }),
        );
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(?addr, "health_server_listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "health_server_failed");
        }
    });
    Ok(())
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServiceConfig {
    pub service_name: String,
    pub listen_addr: String,
    pub health_port: u16,
    pub expected_clients: usize,
    pub model_save_path: PathBuf,
    pub log_level: String,
}

/// Layers defaults, the optional YAML file named by `TREEFED_CONFIG_FILE`,
/// and `TREEFED__*` environment variables. `MODEL_SAVE_PATH` overrides the
/// model location when set.
pub fn load_config(service: &str) -> Result<ServiceConfig> {
    let file = std::env::var("TREEFED_CONFIG_FILE").ok().map(PathBuf::from);
    load_config_from(service, file.as_deref())
}

pub fn load_config_from(service: &str, file: Option<&Path>) -> Result<ServiceConfig> {
    let mut builder = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("listen_addr", "0.0.0.0:50051")?
        .set_default("health_port", 8081_i64)?
        .set_default("expected_clients", 3_i64)?
        .set_default("model_save_path", "global_model_latest.json")?
        .set_default("log_level", "info")?;
    if let Some(file) = file {
        builder = builder.add_source(config::File::from(file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix("TREEFED").separator("__").try_parsing(true));
    let mut cfg: ServiceConfig = builder.build()?.try_deserialize()?;
    if let Ok(path) = std::env::var("MODEL_SAVE_PATH") {
        cfg.model_save_path = PathBuf::from(path);
    }
    if cfg.expected_clients == 0 {
        bail!("expected_clients must be at least 1");
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "expected_clients: 5\nhealth_port: 9099").unwrap();
        let cfg = load_config_from("fl-coordinator", Some(file.path())).unwrap();
        assert_eq!(cfg.expected_clients, 5);
        assert_eq!(cfg.health_port, 9099);
        assert_eq!(cfg.service_name, "fl-coordinator");
    }

    #[test]
    fn zero_expected_clients_rejected() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "expected_clients: 0").unwrap();
        assert!(load_config_from("fl-coordinator", Some(file.path())).is_err());
    }

    #[test]
    fn readiness_flags_toggle() {
        mark_ready();
        assert!(NODE_READINESS.load(Ordering::SeqCst));
        clear_ready();
        assert!(!NODE_READINESS.load(Ordering::SeqCst));
    }

    #[test]
    fn metrics_rendered_after_init() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        let counter = opentelemetry::global::meter("treefed_core_test").u64_counter("treefed_render_check").build();
        counter.add(3, &[]);
        let text = render_metrics().unwrap().expect("registry installed");
        assert!(text.contains("treefed_render_check"), "{text}");
    }
}
