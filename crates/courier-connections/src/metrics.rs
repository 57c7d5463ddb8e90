//! A Prometheus metric registry driven by agent messages.
//!
//! The agent adds metrics and updates them with [`MetricsMessage`]s; every
//! request is answered with a `response` envelope carrying a status code.
//! An optional HTTP exporter serves the registry at `/metrics`.

use crate::queue::InboundQueue;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use courier_types::config::ConnectionConfig;
use courier_types::{
    Address, Connection, ConnectionError, ConnectionResult, ConnectionState, ConnectionStatus,
    Envelope, PublicId, RoutingContext, SetupError,
};
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection id of the metrics transport.
pub const PUBLIC_ID: &str = "courier/metrics:0.1.0";

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_CONFLICT: u16 = 409;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Backend settings read from the `[connections.config]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MetricsSettings {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port of the `/metrics` exporter. No exporter runs without one.
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
        }
    }
}

/// Payload of an envelope on the metrics protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsMessage {
    #[serde(default)]
    pub message_id: i64,
    #[serde(default)]
    pub target: i64,
    #[serde(flatten)]
    pub performative: MetricsPerformative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "performative", rename_all = "snake_case")]
pub enum MetricsPerformative {
    AddMetric {
        /// `Counter`, `Gauge` or `Histogram`.
        #[serde(rename = "type")]
        metric_type: String,
        title: String,
        #[serde(default)]
        description: String,
    },
    UpdateMetric {
        title: String,
        /// Name of the update operation, e.g. `inc` or `set`.
        callable: String,
        #[serde(default)]
        value: f64,
    },
    Response {
        code: u16,
        message: String,
    },
}

impl MetricsMessage {
    pub fn add_metric(
        metric_type: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: 1,
            target: 0,
            performative: MetricsPerformative::AddMetric {
                metric_type: metric_type.into(),
                title: title.into(),
                description: description.into(),
            },
        }
    }

    pub fn update_metric(title: impl Into<String>, callable: impl Into<String>, value: f64) -> Self {
        Self {
            message_id: 1,
            target: 0,
            performative: MetricsPerformative::UpdateMetric {
                title: title.into(),
                callable: callable.into(),
                value,
            },
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// The metric families the registry can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

impl FromStr for MetricKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            "histogram" => Ok(MetricKind::Histogram),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Counter => "Counter",
            MetricKind::Gauge => "Gauge",
            MetricKind::Histogram => "Histogram",
        };
        f.write_str(s)
    }
}

/// Update operations an agent may name in `callable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Inc,
    Dec,
    Set,
    Add,
    Sub,
    Observe,
}

const UPDATE_OPS: &[(&str, UpdateOp)] = &[
    ("inc", UpdateOp::Inc),
    ("dec", UpdateOp::Dec),
    ("set", UpdateOp::Set),
    ("add", UpdateOp::Add),
    ("sub", UpdateOp::Sub),
    ("observe", UpdateOp::Observe),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown update operation '{0}'")]
pub struct UnknownUpdateOp(pub String);

impl FromStr for UpdateOp {
    type Err = UnknownUpdateOp;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UPDATE_OPS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, op)| *op)
            .ok_or_else(|| UnknownUpdateOp(s.to_string()))
    }
}

impl fmt::Display for UpdateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = UPDATE_OPS
            .iter()
            .find(|(_, op)| op == self)
            .map(|(name, _)| *name)
            .unwrap_or("?");
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

impl Metric {
    fn create(kind: MetricKind, title: &str, description: &str) -> prometheus::Result<Self> {
        // Prometheus rejects empty help text.
        let help = if description.is_empty() { title } else { description };
        Ok(match kind {
            MetricKind::Counter => Metric::Counter(Counter::with_opts(Opts::new(title, help))?),
            MetricKind::Gauge => Metric::Gauge(Gauge::with_opts(Opts::new(title, help))?),
            MetricKind::Histogram => {
                Metric::Histogram(Histogram::with_opts(HistogramOpts::new(title, help))?)
            }
        })
    }

    fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        match self {
            Metric::Counter(m) => registry.register(Box::new(m.clone())),
            Metric::Gauge(m) => registry.register(Box::new(m.clone())),
            Metric::Histogram(m) => registry.register(Box::new(m.clone())),
        }
    }

    /// Apply `op`. `false` when this metric kind has no such operation.
    fn apply(&self, op: UpdateOp, value: f64) -> bool {
        match (self, op) {
            (Metric::Counter(c), UpdateOp::Inc | UpdateOp::Add) => {
                // Counters only go up.
                if value < 0.0 {
                    return false;
                }
                c.inc_by(value);
            }
            (Metric::Gauge(g), UpdateOp::Inc | UpdateOp::Add) => g.add(value),
            (Metric::Gauge(g), UpdateOp::Dec | UpdateOp::Sub) => g.sub(value),
            (Metric::Gauge(g), UpdateOp::Set) => g.set(value),
            (Metric::Histogram(h), UpdateOp::Observe) => h.observe(value),
            _ => return false,
        }
        true
    }
}

/// Metrics owned by one connection plus the registry they are exported from.
pub struct MetricsStore {
    registry: Registry,
    metrics: std::sync::Mutex<HashMap<String, Metric>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            metrics: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn contains(&self, title: &str) -> bool {
        self.metrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(title)
    }

    /// Handle one request performative, returning `(code, message)`.
    pub fn add(&self, metric_type: &str, title: &str, description: &str) -> (u16, String) {
        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        if metrics.contains_key(title) {
            return (CODE_CONFLICT, "Metric already exists.".to_string());
        }
        let Ok(kind) = metric_type.parse::<MetricKind>() else {
            return (
                CODE_NOT_FOUND,
                format!("{metric_type} is not a recognized prometheus metric."),
            );
        };
        let metric = match Metric::create(kind, title, description) {
            Ok(m) => m,
            Err(e) => return (CODE_BAD_REQUEST, format!("Invalid metric {title}: {e}")),
        };
        if let Err(e) = metric.register(&self.registry) {
            return (CODE_BAD_REQUEST, format!("Invalid metric {title}: {e}"));
        }
        metrics.insert(title.to_string(), metric);
        debug!(%kind, title, "Metric added");
        (CODE_OK, format!("New {kind} successfully added: {title}."))
    }

    pub fn update(&self, title: &str, callable: &str, value: f64) -> (u16, String) {
        let metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        let Some(metric) = metrics.get(title) else {
            return (CODE_NOT_FOUND, format!("Metric {title} not found."));
        };
        let unsupported = || {
            (
                CODE_BAD_REQUEST,
                format!("Update function {callable} not found for metric {title}."),
            )
        };
        let op = match callable.parse::<UpdateOp>() {
            Ok(op) => op,
            Err(e) => {
                debug!(error = %e, title, "Rejected metric update");
                return unsupported();
            }
        };
        if !metric.apply(op, value) {
            return unsupported();
        }
        (CODE_OK, format!("Metric {title} successfully updated."))
    }

    /// Prometheus text exposition of every registered metric.
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn metrics_handler(State(store): State<Arc<MetricsStore>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        store.export(),
    )
}

fn exporter_router(store: Arc<MetricsStore>) -> axum::Router {
    axum::Router::new()
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(store)
}

struct Exporter {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Transport that keeps a metric registry on behalf of the agent.
pub struct MetricsConnection {
    state: ConnectionState,
    settings: MetricsSettings,
    store: Arc<MetricsStore>,
    responses: InboundQueue,
    exporter: tokio::sync::Mutex<Option<Exporter>>,
}

impl MetricsConnection {
    pub fn new(
        connection_id: PublicId,
        address: impl Into<Address>,
        settings: MetricsSettings,
    ) -> Self {
        Self {
            state: ConnectionState::new(connection_id, address.into()),
            settings,
            store: Arc::new(MetricsStore::new()),
            responses: InboundQueue::new(),
            exporter: tokio::sync::Mutex::new(None),
        }
    }

    pub fn from_config(
        config: &ConnectionConfig,
        address: impl Into<Address>,
    ) -> ConnectionResult<Self> {
        let settings: MetricsSettings = config.settings()?;
        Ok(
            Self::new(config.connection_id.clone(), address, settings).with_filters(
                config.restricted_to_protocols.clone(),
                config.excluded_protocols.clone(),
            ),
        )
    }

    pub fn with_filters(
        mut self,
        restricted_to_protocols: BTreeSet<PublicId>,
        excluded_protocols: BTreeSet<PublicId>,
    ) -> Self {
        self.state = ConnectionState::new(
            self.state.connection_id().clone(),
            self.state.address().clone(),
        )
        .with_filters(restricted_to_protocols, excluded_protocols);
        self
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    /// Bound address of the running exporter, if any.
    pub async fn exporter_addr(&self) -> Option<SocketAddr> {
        self.exporter.lock().await.as_ref().map(|e| e.addr)
    }

    async fn start_exporter(&self, port: u16) -> Result<Exporter, SetupError> {
        let requested = format!("{}:{port}", self.settings.host);
        let listener = tokio::net::TcpListener::bind(&requested)
            .await
            .map_err(|e| SetupError::Bind {
                addr: requested.clone(),
                reason: e.to_string(),
            })?;
        let addr = listener.local_addr().map_err(|e| SetupError::Bind {
            addr: requested,
            reason: e.to_string(),
        })?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let app = exporter_router(self.store.clone());
        let task = tokio::spawn(async move {
            info!(%addr, "Metrics exporter listening");
            tokio::select! {
                result = axum::serve(listener, app) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Metrics exporter failed");
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
            info!(%addr, "Metrics exporter stopped");
        });
        Ok(Exporter {
            addr,
            shutdown_tx,
            task,
        })
    }

    fn reply(&self, request: &Envelope, request_id: i64, code: u16, text: String) {
        let message = MetricsMessage {
            message_id: request_id + 1,
            target: request_id,
            performative: MetricsPerformative::Response {
                code,
                message: text,
            },
        };
        let context = RoutingContext::for_connection(self.state.connection_id().clone());
        match Envelope::new(
            request.sender().clone(),
            request.to().clone(),
            request.protocol_id().clone(),
            message.encode(),
        ) {
            Ok(response) => {
                if !self.responses.push(response.with_context(context)) {
                    debug!("Metrics response dropped, queue closed");
                }
            }
            Err(e) => warn!(error = %e, "Could not build metrics response envelope"),
        }
    }
}

#[async_trait]
impl Connection for MetricsConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.state.set_status(ConnectionStatus::Connecting);
        if let Some(port) = self.settings.port {
            match self.start_exporter(port).await {
                Ok(exporter) => *self.exporter.lock().await = Some(exporter),
                Err(e) => {
                    self.state.set_status(ConnectionStatus::Disconnected);
                    return Err(e.into());
                }
            }
        }
        self.responses.open().await;
        self.state.set_status(ConnectionStatus::Connected);
        info!(connection = %self.state.connection_id(), "Metrics connection up");
        Ok(())
    }

    async fn disconnect(&self) -> ConnectionResult<()> {
        if self.state.is_disconnected() {
            return Ok(());
        }
        self.state.set_status(ConnectionStatus::Disconnecting);
        if let Some(exporter) = self.exporter.lock().await.take() {
            let _ = exporter.shutdown_tx.send(true);
            if let Err(e) = exporter.task.await {
                debug!(error = %e, "Metrics exporter task ended abnormally");
            }
        }
        self.responses.close();
        self.state.set_status(ConnectionStatus::Disconnected);
        info!(connection = %self.state.connection_id(), "Metrics connection down");
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> ConnectionResult<()> {
        self.state.ensure_sendable(&envelope)?;
        let message = MetricsMessage::decode(envelope.message()).map_err(|e| {
            ConnectionError::InvalidMessage {
                connection: self.state.connection_id().clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(sender = %envelope.sender(), "Processing metrics message");

        let (code, text) = match &message.performative {
            MetricsPerformative::AddMetric {
                metric_type,
                title,
                description,
            } => self.store.add(metric_type, title, description),
            MetricsPerformative::UpdateMetric {
                title,
                callable,
                value,
            } => self.store.update(title, callable, *value),
            MetricsPerformative::Response { .. } => {
                warn!(
                    connection = %self.state.connection_id(),
                    "Dropping metrics response sent by the agent"
                );
                return Ok(());
            }
        };
        self.reply(&envelope, message.message_id, code, text);
        Ok(())
    }

    async fn receive(&self) -> ConnectionResult<Option<Envelope>> {
        self.state.ensure_connected()?;
        Ok(self.responses.next().await)
    }
}
