//! Duplex named-pipe channel between the manager and a node process.
//!
//! Two FIFOs per node: `node_to_agent` (manager reads) and `agent_to_node`
//! (manager writes). Both ends are opened non-blocking through
//! `tokio::net::unix::pipe`, so reads and writes are driven by the runtime.

use courier_types::{ConnectionError, SetupError};
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::unix::pipe;
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Default number of attempts to open the outbound pipe.
pub const DEFAULT_OPEN_ATTEMPTS: u32 = 30;
/// Default sleep between attempts.
pub const DEFAULT_OPEN_BACKOFF: Duration = Duration::from_millis(2000);

/// Filesystem paths of a node's two FIFOs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    /// Node writes, manager reads.
    pub inbound: PathBuf,
    /// Manager writes, node reads.
    pub outbound: PathBuf,
}

impl PipePaths {
    /// Deterministic names derived from the first characters of the node's
    /// public key, so the same identity always maps to the same pipes.
    pub fn for_identity(dir: &Path, public_hex: &str) -> Self {
        let tag: String = public_hex.chars().take(5).collect();
        Self {
            inbound: dir.join(format!("{tag}-node_to_agent")),
            outbound: dir.join(format!("{tag}-agent_to_node")),
        }
    }

    /// Create both FIFOs (owner read/write only), replacing stale ones.
    pub fn create(&self) -> Result<(), SetupError> {
        for path in [&self.inbound, &self.outbound] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale pipe"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(SetupError::Pipes(format!(
                        "cannot remove {}: {e}",
                        path.display()
                    )))
                }
            }
            nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| {
                SetupError::Pipes(format!("mkfifo {} failed: {e}", path.display()))
            })?;
        }
        debug!(
            inbound = %self.inbound.display(),
            outbound = %self.outbound.display(),
            "Created pipes"
        );
        Ok(())
    }

    /// Remove both FIFOs. Missing files are fine.
    pub fn remove(&self) {
        for path in [&self.inbound, &self.outbound] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Failed to remove pipe");
                }
            }
        }
    }

    pub fn exist(&self) -> bool {
        self.inbound.exists() && self.outbound.exists()
    }
}

/// Bounded retry budget for opening the outbound pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_ATTEMPTS, DEFAULT_OPEN_BACKOFF)
    }
}

/// Both open ends of a node's pipes.
#[derive(Debug)]
pub struct DuplexPipe {
    pub reader: BufReader<pipe::Receiver>,
    pub writer: pipe::Sender,
}

/// `true` for the "no reader on the other end yet" failure of a
/// non-blocking FIFO write-open.
pub fn is_no_reader(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::ENXIO as i32)
}

/// Open the manager's ends of `paths`.
///
/// The inbound end opens immediately. The outbound end fails with ENXIO
/// until the node has opened its read side; that one error is retried after
/// `policy.backoff`, up to `policy.attempts` times. Any other error is
/// returned at once. When `child` is given, an exited child ends the wait
/// early.
pub async fn open_duplex(
    paths: &PipePaths,
    policy: RetryPolicy,
    mut child: Option<&mut Child>,
) -> Result<DuplexPipe, ConnectionError> {
    let receiver = pipe::OpenOptions::new()
        .open_receiver(&paths.inbound)
        .map_err(|e| {
            SetupError::Pipes(format!("cannot open {}: {e}", paths.inbound.display()))
        })?;

    let mut remaining = policy.attempts;
    loop {
        remaining = remaining.saturating_sub(1);
        match pipe::OpenOptions::new().open_sender(&paths.outbound) {
            Ok(writer) => {
                info!(
                    attempts = policy.attempts - remaining,
                    "Pipes to node process connected"
                );
                return Ok(DuplexPipe {
                    reader: BufReader::new(receiver),
                    writer,
                });
            }
            Err(e) if is_no_reader(&e) => {
                if let Some(child) = child.as_deref_mut() {
                    if let Some(status) = child.try_wait()? {
                        return Err(ConnectionError::PeerProcess(format!(
                            "node process exited with {status} before opening its pipes"
                        )));
                    }
                }
                if remaining == 0 {
                    warn!(attempts = policy.attempts, "Node never opened its pipe");
                    return Err(ConnectionError::PeerProcess(format!(
                        "Couldn't connect to the node process after {} attempts",
                        policy.attempts
                    )));
                }
                debug!(remaining, "Node not reading yet, retrying");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => {
                return Err(SetupError::Pipes(format!(
                    "cannot open {}: {e}",
                    paths.outbound.display()
                ))
                .into())
            }
        }
    }
}

/// Open the node's ends of `paths`.
///
/// Mirror image of [`open_duplex`]: the sender to the manager is retried on
/// ENXIO first, then the receiver is opened read-write so the node never
/// sees end-of-file while the manager is between writes.
pub async fn open_node_side(
    node_to_agent: &Path,
    agent_to_node: &Path,
    policy: RetryPolicy,
) -> io::Result<DuplexPipe> {
    let mut remaining = policy.attempts;
    let writer = loop {
        remaining = remaining.saturating_sub(1);
        match pipe::OpenOptions::new().open_sender(node_to_agent) {
            Ok(writer) => break writer,
            Err(e) if is_no_reader(&e) && remaining > 0 => {
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    };
    let receiver = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(agent_to_node)?;
    Ok(DuplexPipe {
        reader: BufReader::new(receiver),
        writer,
    })
}
