//! Overlay node process manager.
//!
//! [`OverlayNode`] runs one overlay node as a child process and hands back
//! the duplex pipe to it. Startup walks a fixed sequence of states; any
//! failure tears down whatever was already acquired before returning.

use crate::env::NodeEnv;
use crate::pipe::{self, DuplexPipe, PipePaths, RetryPolicy};
use crate::process::{self, NodeLauncher, DEFAULT_GRACE_MS};
use crate::uri::Uri;
use courier_types::{Address, ConnectionError, ConnectionResult, KeyPair, SetupError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Default log file for the node's stdout and stderr.
pub const DEFAULT_LOG_FILE: &str = "libp2p_node.log";
/// Env file name used inside the node's pipe directory.
pub const DEFAULT_ENV_FILE: &str = ".env.libp2p";

/// Startup progress of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    FetchingDependencies,
    PipesCreated,
    ProcessStarted,
    ConnectingPipes,
    Connected,
    Stopped,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Uninitialized => "uninitialized",
            NodeState::FetchingDependencies => "fetching_dependencies",
            NodeState::PipesCreated => "pipes_created",
            NodeState::ProcessStarted => "process_started",
            NodeState::ConnectingPipes => "connecting_pipes",
            NodeState::Connected => "connected",
            NodeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Everything needed to construct an [`OverlayNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub key: KeyPair,
    /// Required for genesis nodes (no entry peers).
    pub bind_uri: Option<Uri>,
    pub entry_peers: Vec<Uri>,
    pub log_file: PathBuf,
    /// Where to write the env file. Defaults to the pipe directory.
    pub env_file: Option<PathBuf>,
    /// Where to create the pipes. Defaults to a fresh temporary directory.
    pub pipe_dir: Option<PathBuf>,
    pub launcher: NodeLauncher,
    pub retry: RetryPolicy,
    pub grace: Duration,
}

impl NodeConfig {
    pub fn new(key: KeyPair, launcher: NodeLauncher) -> Self {
        Self {
            key,
            bind_uri: None,
            entry_peers: Vec::new(),
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            env_file: None,
            pipe_dir: None,
            launcher,
            retry: RetryPolicy::default(),
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
        }
    }

    pub fn bind(mut self, uri: Uri) -> Self {
        self.bind_uri = Some(uri);
        self
    }

    pub fn entry_peers(mut self, peers: Vec<Uri>) -> Self {
        self.entry_peers = peers;
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = path.into();
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// One overlay node child process and its pipes.
pub struct OverlayNode {
    key: KeyPair,
    bind_uri: Uri,
    entry_peers: Vec<Uri>,
    log_file: PathBuf,
    env_file_override: Option<PathBuf>,
    pipe_dir_override: Option<PathBuf>,
    launcher: NodeLauncher,
    retry: RetryPolicy,
    grace: Duration,

    state: NodeState,
    temp_dir: Option<TempDir>,
    pipes: Option<PipePaths>,
    env_file: Option<PathBuf>,
    child: Option<Child>,
    duplex: Option<DuplexPipe>,
}

impl OverlayNode {
    /// Validate the config. Nothing is spawned or created here.
    ///
    /// A node without entry peers is a genesis node and must be given a
    /// bind URI. Other nodes without one get a random local port. The
    /// launcher's runtime must be installed.
    pub fn new(config: NodeConfig) -> ConnectionResult<Self> {
        let bind_uri = match (config.bind_uri, config.entry_peers.is_empty()) {
            (Some(uri), _) => uri,
            (None, true) => {
                return Err(ConnectionError::InvalidConfig(
                    "an overlay node needs a bind URI or at least one entry peer".into(),
                ))
            }
            (None, false) => Uri::random_local(),
        };
        config.launcher.check_runtime()?;

        Ok(Self {
            key: config.key,
            bind_uri,
            entry_peers: config.entry_peers,
            log_file: config.log_file,
            env_file_override: config.env_file,
            pipe_dir_override: config.pipe_dir,
            launcher: config.launcher,
            retry: config.retry,
            grace: config.grace,
            state: NodeState::Uninitialized,
            temp_dir: None,
            pipes: None,
            env_file: None,
            child: None,
            duplex: None,
        })
    }

    /// The node's overlay address (its public key hex).
    pub fn address(&self) -> Address {
        self.key.address()
    }

    pub fn bind_uri(&self) -> &Uri {
        &self.bind_uri
    }

    pub fn entry_peers(&self) -> &[Uri] {
        &self.entry_peers
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Pipe paths, once created.
    pub fn pipes(&self) -> Option<&PipePaths> {
        self.pipes.as_ref()
    }

    /// Env file path, once written.
    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_deref()
    }

    fn transition(&mut self, next: NodeState) {
        debug!(from = %self.state, to = %next, "Overlay node state");
        self.state = next;
    }

    /// Build, spawn and connect to the node.
    ///
    /// A no-op once connected. A stopped node cannot be started again. On
    /// failure everything acquired so far is released and the node returns
    /// to `uninitialized`.
    pub async fn start(&mut self) -> ConnectionResult<()> {
        match self.state {
            NodeState::Connected => return Ok(()),
            NodeState::Stopped => return Err(SetupError::AlreadyStopped.into()),
            _ => {}
        }
        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, stage = %self.state, "Overlay node failed to start");
                self.release().await;
                self.transition(NodeState::Uninitialized);
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> ConnectionResult<()> {
        self.transition(NodeState::FetchingDependencies);
        let log = process::open_log(&self.log_file)?;
        self.launcher.fetch_dependencies(&log)?;

        let dir = match &self.pipe_dir_override {
            Some(dir) => {
                std::fs::create_dir_all(dir)
                    .map_err(|e| SetupError::Pipes(format!("{}: {e}", dir.display())))?;
                dir.clone()
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("courier-node-")
                    .tempdir()
                    .map_err(|e| SetupError::Pipes(format!("cannot create pipe dir: {e}")))?;
                let path = temp.path().to_path_buf();
                self.temp_dir = Some(temp);
                path
            }
        };
        let paths = PipePaths::for_identity(&dir, &self.key.public_hex());
        self.pipes = Some(paths.clone());
        paths.create()?;
        self.transition(NodeState::PipesCreated);

        let env = NodeEnv::new(
            self.key.identity_string(),
            self.bind_uri.clone(),
            &self.entry_peers,
            paths.inbound.clone(),
            paths.outbound.clone(),
        );
        let env_file = self
            .env_file_override
            .clone()
            .unwrap_or_else(|| dir.join(DEFAULT_ENV_FILE));
        self.env_file = Some(env_file.clone());
        env.write_file(&env_file)
            .map_err(|e| SetupError::StartupFiles(format!("{}: {e}", env_file.display())))?;

        let child = self.launcher.spawn(&env_file, &env.vars(), &log)?;
        self.child = Some(child);
        self.transition(NodeState::ProcessStarted);

        self.transition(NodeState::ConnectingPipes);
        let duplex = pipe::open_duplex(&paths, self.retry, self.child.as_mut()).await?;
        self.duplex = Some(duplex);
        self.transition(NodeState::Connected);
        info!(
            address = %self.address(),
            uri = %self.bind_uri,
            entry_peers = self.entry_peers.len(),
            "Overlay node connected"
        );
        Ok(())
    }

    /// Hand over the open pipe ends. Returns `None` if not connected or
    /// already taken.
    pub fn take_duplex(&mut self) -> Option<DuplexPipe> {
        self.duplex.take()
    }

    /// Stop the node and release everything it owns. Safe to call in any
    /// state and more than once.
    pub async fn stop(&mut self) {
        if self.state == NodeState::Stopped {
            return;
        }
        self.release().await;
        self.transition(NodeState::Stopped);
    }

    async fn release(&mut self) {
        self.duplex = None;
        if let Some(mut child) = self.child.take() {
            process::terminate(&mut child, self.grace).await;
        }
        if let Some(paths) = self.pipes.take() {
            paths.remove();
        }
        if let Some(env_file) = self.env_file.take() {
            if let Err(e) = std::fs::remove_file(&env_file) {
                debug!(path = %env_file.display(), error = %e, "Env file not removed");
            }
        }
        if let Some(dir) = self.temp_dir.take() {
            if let Err(e) = dir.close() {
                debug!(error = %e, "Pipe dir not removed");
            }
        }
    }
}
