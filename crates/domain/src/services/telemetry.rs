//! Process-wide tracing and Prometheus wiring. Both layers are installed at
//! most once; later calls reuse the first recorder.

use std::{env, net::SocketAddr};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

static TRACING: OnceCell<()> = OnceCell::new();
static RECORDER: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    service: String,
    log_filter: String,
    metrics_listener: Option<SocketAddr>,
}

impl TelemetryConfig {
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    pub fn new(service: &str) -> Self {
        Self {
            service: service.trim().to_ascii_uppercase(),
            log_filter: Self::DEFAULT_LOG_FILTER.to_string(),
            metrics_listener: None,
        }
    }

    /// Reads `<SERVICE>_LOG_FILTER` and `<SERVICE>_METRICS_ADDRESS`. Blank
    /// values count as unset; an unparsable listener address is an error.
    pub fn from_env(service: &str) -> Result<Self, TelemetryError> {
        let _ = hydrate_env_file();
        let mut config = Self::new(service);

        if let Some(filter) = non_blank(&config.env_key("LOG_FILTER")) {
            config.log_filter = filter;
        }
        if let Some(raw) = non_blank(&config.env_key("METRICS_ADDRESS")) {
            let addr = raw
                .parse()
                .map_err(|err: std::net::AddrParseError| {
                    TelemetryError::InvalidMetricsAddress(raw.clone(), err.to_string())
                })?;
            config.metrics_listener = Some(addr);
        }
        Ok(config)
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_listener(&self) -> Option<SocketAddr> {
        self.metrics_listener
    }

    fn env_key(&self, suffix: &str) -> String {
        format!("{}_{suffix}", self.service)
    }
}

fn non_blank(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Handle to the installed Prometheus recorder.
#[derive(Clone)]
pub struct TelemetryGuard {
    metrics: PrometheusHandle,
}

impl TelemetryGuard {
    /// Current exposition text, for scraping without the HTTP listener.
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }
}

pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;
    TRACING.get_or_try_init(|| {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))
    })?;

    let metrics = RECORDER
        .get_or_try_init(|| {
            let mut builder = PrometheusBuilder::new();
            if let Some(addr) = config.metrics_listener() {
                builder = builder.with_http_listener(addr);
            }
            let handle = builder
                .install_recorder()
                .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
            describe_scan_metrics();
            Ok::<_, TelemetryError>(handle)
        })?
        .clone();

    tracing::info!(service = config.service(), "telemetry initialized");
    Ok(TelemetryGuard { metrics })
}

fn describe_scan_metrics() {
    describe_counter!("scan_runs_total", "Scan runs by final result");
    describe_counter!("scan_retries_total", "Scan attempts retried after a failure");
    describe_counter!("scan_candidates_total", "Anomaly candidates by detection rule");
    describe_counter!(
        "scan_detector_failures_total",
        "Detector runs skipped after an internal error"
    );
    describe_counter!("scan_alerts_total", "Alert outcomes by result");
    describe_histogram!("scan_batch_rows", "Payments fetched per run");
    describe_gauge!("scan_watermark_block", "Block of the persisted scan watermark");
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
