//! The overlay node as a [`Connection`].

use crate::frame::{read_envelope, write_envelope};
use crate::node::{NodeConfig, OverlayNode, DEFAULT_LOG_FILE};
use crate::pipe::{RetryPolicy, DEFAULT_OPEN_ATTEMPTS};
use crate::process::{NodeLauncher, DEFAULT_GRACE_MS};
use crate::uri::Uri;
use crate::WireError;
use async_trait::async_trait;
use courier_types::config::ConnectionConfig;
use courier_types::{
    Connection, ConnectionError, ConnectionResult, ConnectionState, ConnectionStatus, Envelope,
    KeyPair, PublicId,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection id of the overlay transport.
pub const PUBLIC_ID: &str = "courier/p2p_overlay:0.1.0";

/// Backend settings read from the `[connections.config]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OverlaySettings {
    /// Hex secret key file. A fresh key is generated when absent.
    pub key_file: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Bootstrap peers as `host:port`.
    pub entry_peers: Vec<String>,
    pub log_file: PathBuf,
    pub env_file: Option<PathBuf>,
    pub pipe_dir: Option<PathBuf>,
    /// Directory holding the node sources or binary.
    pub node_dir: Option<PathBuf>,
    /// Prebuilt node executable. Without it the Go libp2p node is built.
    pub node_program: Option<PathBuf>,
    pub node_args: Vec<String>,
    pub runtime: Option<String>,
    pub fetch_command: Option<Vec<String>>,
    pub pipe_open_attempts: u32,
    pub pipe_open_backoff_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            key_file: None,
            host: None,
            port: None,
            entry_peers: Vec::new(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            env_file: None,
            pipe_dir: None,
            node_dir: None,
            node_program: None,
            node_args: Vec::new(),
            runtime: None,
            fetch_command: None,
            pipe_open_attempts: DEFAULT_OPEN_ATTEMPTS,
            pipe_open_backoff_ms: 2000,
            shutdown_grace_ms: DEFAULT_GRACE_MS,
        }
    }
}

impl OverlaySettings {
    fn launcher(&self) -> NodeLauncher {
        let mut launcher = match &self.node_program {
            Some(program) => {
                let mut l = NodeLauncher::prebuilt(program.clone());
                if let Some(dir) = &self.node_dir {
                    l.work_dir = dir.clone();
                }
                l
            }
            None => NodeLauncher::libp2p(
                self.node_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
            ),
        };
        if let Some(runtime) = &self.runtime {
            launcher.runtime = Some(runtime.clone());
        }
        if let Some(fetch) = &self.fetch_command {
            launcher.fetch_command = fetch.clone();
        }
        launcher.with_args(self.node_args.clone())
    }

    fn bind_uri(&self) -> ConnectionResult<Option<Uri>> {
        match (&self.host, self.port) {
            (host, Some(port)) => Ok(Some(Uri::new(
                host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                port,
            ))),
            (Some(host), None) => Err(ConnectionError::InvalidConfig(format!(
                "host '{host}' given without a port"
            ))),
            (None, None) => Ok(None),
        }
    }

    /// Resolve into a node config, loading or generating the key.
    pub fn node_config(&self) -> ConnectionResult<NodeConfig> {
        let key = match &self.key_file {
            Some(path) => KeyPair::from_key_file(path).map_err(ConnectionError::InvalidConfig)?,
            None => KeyPair::generate(),
        };
        let entry_peers = self
            .entry_peers
            .iter()
            .map(|s| s.parse::<Uri>().map_err(ConnectionError::InvalidConfig))
            .collect::<ConnectionResult<Vec<_>>>()?;
        Ok(NodeConfig {
            key,
            bind_uri: self.bind_uri()?,
            entry_peers,
            log_file: self.log_file.clone(),
            env_file: self.env_file.clone(),
            pipe_dir: self.pipe_dir.clone(),
            launcher: self.launcher(),
            retry: RetryPolicy::new(
                self.pipe_open_attempts,
                Duration::from_millis(self.pipe_open_backoff_ms),
            ),
            grace: Duration::from_millis(self.shutdown_grace_ms),
        })
    }
}

/// What the inbound pump saw.
#[derive(Debug)]
enum PumpEvent {
    Envelope(Envelope),
    Corrupted(String),
}

/// Read frames until end-of-stream or corruption. Returning drops `tx`,
/// which `receive` sees as closure.
async fn pump(mut reader: BufReader<pipe::Receiver>, tx: mpsc::UnboundedSender<PumpEvent>) {
    loop {
        match read_envelope(&mut reader).await {
            Ok(Some(envelope)) => {
                if tx.send(PumpEvent::Envelope(envelope)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("Node pipe reached end of stream");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Corrupt frame from node process");
                let _ = tx.send(PumpEvent::Corrupted(e.to_string()));
                return;
            }
        }
    }
}

/// Transport backed by a local overlay node process.
///
/// The connection cannot be reused once it has been connected and then
/// stopped; build a new one to rejoin the network.
pub struct OverlayConnection {
    state: ConnectionState,
    node: Mutex<OverlayNode>,
    writer: Mutex<Option<pipe::Sender>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<PumpEvent>>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl OverlayConnection {
    /// Wrap a validated node.
    pub fn new(connection_id: PublicId, node: OverlayNode) -> Self {
        let state = ConnectionState::new(connection_id, node.address());
        Self {
            state,
            node: Mutex::new(node),
            writer: Mutex::new(None),
            inbound: Mutex::new(None),
            pump: std::sync::Mutex::new(None),
        }
    }

    /// Build from a `[[connections]]` entry. Validation and the runtime
    /// check happen here, before any process exists.
    pub fn from_config(config: &ConnectionConfig) -> ConnectionResult<Self> {
        let settings: OverlaySettings = config.settings()?;
        let node = OverlayNode::new(settings.node_config()?)?;
        Ok(Self::new(config.connection_id.clone(), node).with_filters(
            config.restricted_to_protocols.clone(),
            config.excluded_protocols.clone(),
        ))
    }

    /// Apply protocol filters.
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

    /// The node's bind URI, for handing to peers as an entry point.
    pub async fn bind_uri(&self) -> Uri {
        self.node.lock().await.bind_uri().clone()
    }

    fn stop_pump(&self) {
        let handle = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Tear down after the node's stream ended on its own.
    async fn on_stream_closed(&self) {
        if self.state.status() != ConnectionStatus::Connected {
            return;
        }
        info!(connection = %self.state.connection_id(), "Overlay node closed its pipe");
        self.state.set_status(ConnectionStatus::Disconnecting);
        self.stop_pump();
        self.node.lock().await.stop().await;
        self.writer.lock().await.take();
        self.state.set_status(ConnectionStatus::Disconnected);
    }
}

#[async_trait]
impl Connection for OverlayConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn connect(&self) -> ConnectionResult<()> {
        if self.state.is_connected() {
            return Ok(());
        }
        self.state.set_status(ConnectionStatus::Connecting);

        let duplex = {
            let mut node = self.node.lock().await;
            if let Err(e) = node.start().await {
                self.state.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
            node.take_duplex()
        };
        let Some(duplex) = duplex else {
            self.state.set_status(ConnectionStatus::Disconnected);
            return Err(ConnectionError::PeerProcess(
                "node pipes were already handed out".into(),
            ));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.writer.lock().await = Some(duplex.writer);
        *self.inbound.lock().await = Some(rx);
        let handle = tokio::spawn(pump(duplex.reader, tx));
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        self.state.set_status(ConnectionStatus::Connected);
        info!(
            connection = %self.state.connection_id(),
            address = %self.state.address(),
            "Overlay connection up"
        );
        Ok(())
    }

    async fn disconnect(&self) -> ConnectionResult<()> {
        if self.state.is_disconnected() {
            return Ok(());
        }
        self.state.set_status(ConnectionStatus::Disconnecting);
        self.stop_pump();
        // Stopping the node first unblocks any writer stuck on a full pipe.
        self.node.lock().await.stop().await;
        self.writer.lock().await.take();
        self.state.set_status(ConnectionStatus::Disconnected);
        info!(connection = %self.state.connection_id(), "Overlay connection down");
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> ConnectionResult<()> {
        self.state.ensure_sendable(&envelope)?;
        let mut writer = self.writer.lock().await;
        let Some(pipe) = writer.as_mut() else {
            return Err(ConnectionError::NotConnected(
                self.state.connection_id().clone(),
            ));
        };
        match write_envelope(pipe, &envelope).await {
            Ok(()) => Ok(()),
            Err(WireError::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => Err(
                ConnectionError::PeerProcess("node process closed its pipe".into()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn receive(&self) -> ConnectionResult<Option<Envelope>> {
        let mut inbound = self.inbound.lock().await;
        let Some(rx) = inbound.as_mut() else {
            return Err(ConnectionError::NotConnected(
                self.state.connection_id().clone(),
            ));
        };
        loop {
            match rx.recv().await {
                Some(PumpEvent::Envelope(envelope)) => {
                    if self.state.supports_protocol(envelope.protocol_id()) {
                        return Ok(Some(envelope));
                    }
                    warn!(
                        connection = %self.state.connection_id(),
                        protocol = %envelope.protocol_id(),
                        "Dropping inbound envelope with filtered protocol"
                    );
                }
                Some(PumpEvent::Corrupted(reason)) => {
                    drop(inbound);
                    self.on_stream_closed().await;
                    return Err(ConnectionError::Framing(reason));
                }
                None => {
                    drop(inbound);
                    self.on_stream_closed().await;
                    return Ok(None);
                }
            }
        }
    }
}
