//! Reference overlay node.
//!
//! A node listens on its bind URI, dials its entry peers and keeps
//! one TCP link per peer. Each link starts with a `hello` carrying the
//! sender's address and listening URI, followed by the URIs it knows so the
//! network fills in to a full mesh. Envelopes read from the agent pipe are
//! routed by their `to` address: to the agent pipe if addressed to this node,
//! to the matching peer otherwise, or held until that peer appears.

use crate::env::NodeEnv;
use crate::error::WireError;
use crate::frame::{read_envelope, read_frame, write_envelope, write_frame};
use crate::message::{decode_message, encode_message, MeshMessage, PROTOCOL_VERSION};
use crate::pipe::{open_node_side, RetryPolicy};
use crate::registry::{PeerRegistry, Route, MAX_PENDING_PER_ADDRESS};
use crate::uri::Uri;
use courier_types::{Address, Envelope};
use std::future::Future;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const DIAL_ATTEMPTS: u32 = 20;
const DIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Address part of an identity string (`secret hex ++ public hex`).
pub fn address_from_identity(identity: &str) -> Result<Address, WireError> {
    if identity.len() != 128 || !identity.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(WireError::Environment(
            "identity must be 64 bytes of hex (secret key then public key)".into(),
        ));
    }
    Ok(Address::new(&identity[64..]))
}

/// Shared handles of a running node.
#[derive(Clone)]
struct MeshNode {
    address: Address,
    listen_uri: Uri,
    registry: PeerRegistry,
    to_agent: mpsc::UnboundedSender<Envelope>,
}

impl MeshNode {
    /// Route one envelope coming from the agent.
    fn dispatch(&self, envelope: Envelope) {
        if envelope.to() == &self.address {
            let _ = self.to_agent.send(envelope);
            return;
        }
        let to = envelope.to().clone();
        match self.registry.route(envelope) {
            Route::Forwarded => {}
            Route::Held => debug!(
                pending = self.registry.pending_count(),
                "Holding envelope for unknown address"
            ),
            Route::Dropped => warn!(
                to = %to,
                limit = MAX_PENDING_PER_ADDRESS,
                "Dropping envelope, backlog for unknown address is full"
            ),
        }
    }

    /// Dial `uri` unless it is already known, retrying while it is not up.
    fn dial(&self, uri: Uri) {
        if !self.registry.learn_uri(&uri.to_string()) {
            return;
        }
        let node = self.clone();
        tokio::spawn(async move {
            for attempt in 1..=DIAL_ATTEMPTS {
                match TcpStream::connect((uri.host(), uri.port())).await {
                    Ok(stream) => {
                        info!(peer = %uri, attempt, "Dialed peer");
                        if let Err(e) = node.run_link(stream).await {
                            debug!(peer = %uri, error = %e, "Link ended");
                        }
                        return;
                    }
                    Err(e) => {
                        debug!(peer = %uri, attempt, error = %e, "Dial failed");
                        tokio::time::sleep(DIAL_BACKOFF).await;
                    }
                }
            }
            warn!(peer = %uri, attempts = DIAL_ATTEMPTS, "Giving up on peer");
        });
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted peer link");
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.run_link(stream).await {
                            debug!(%addr, error = %e, "Link ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Drive one peer link, in either direction, until it closes.
    async fn run_link(&self, stream: TcpStream) -> Result<(), WireError> {
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(link_writer(writer, rx));

        let _ = tx.send(MeshMessage::hello(
            self.address.as_str(),
            self.listen_uri.to_string(),
        ));

        let peer = match read_message(&mut reader).await? {
            Some(MeshMessage::Hello {
                address,
                listen_uri,
                protocol_version,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    writer_task.abort();
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: protocol_version,
                    });
                }
                self.registry.learn_uri(&listen_uri);
                Address::new(address)
            }
            Some(_) => {
                writer_task.abort();
                return Err(WireError::HandshakeFailed("expected hello first".into()));
            }
            None => {
                writer_task.abort();
                return Err(WireError::HandshakeFailed("closed before hello".into()));
            }
        };
        info!(peer = %peer, "Peer joined");

        let _ = tx.send(MeshMessage::Peers {
            uris: self.registry.known_uris(),
        });
        self.registry.add_peer(peer.clone(), tx.clone());

        let result = self.link_loop(&mut reader, &peer).await;
        self.registry.remove_peer(&peer, &tx);
        drop(tx);
        writer_task.abort();
        info!(peer = %peer, "Peer left");
        result
    }

    async fn link_loop(&self, reader: &mut OwnedReadHalf, peer: &Address) -> Result<(), WireError> {
        while let Some(msg) = read_message(reader).await? {
            match msg {
                MeshMessage::Deliver { .. } => match msg.envelope() {
                    Ok(Some(envelope)) => self.dispatch(envelope),
                    Ok(None) => {}
                    Err(e) => warn!(peer = %peer, error = %e, "Dropping bad delivery"),
                },
                MeshMessage::Peers { uris } => {
                    for uri in uris {
                        match uri.parse::<Uri>() {
                            Ok(uri) if uri != self.listen_uri => self.dial(uri),
                            Ok(_) => {}
                            Err(e) => debug!(peer = %peer, error = %e, "Ignoring bad peer URI"),
                        }
                    }
                }
                MeshMessage::Hello { .. } => {
                    warn!(peer = %peer, "Unexpected second hello");
                }
                MeshMessage::Goodbye => {
                    debug!(peer = %peer, "Peer said goodbye");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

async fn read_message(reader: &mut OwnedReadHalf) -> Result<Option<MeshMessage>, WireError> {
    match read_frame(reader).await? {
        Some(body) => Ok(Some(decode_message(&body)?)),
        None => Ok(None),
    }
}

async fn link_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<MeshMessage>) {
    while let Some(msg) = rx.recv().await {
        let result = match encode_message(&msg) {
            Ok(body) => write_frame(&mut writer, &body).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(error = %e, "Peer link write failed");
            return;
        }
    }
}

/// Run a node until `shutdown` resolves or the agent closes its pipe.
pub async fn run_until<F>(env: NodeEnv, retry: RetryPolicy, shutdown: F) -> Result<(), WireError>
where
    F: Future<Output = ()>,
{
    let address = address_from_identity(&env.identity)?;
    let listener = TcpListener::bind((env.bind_uri.host(), env.bind_uri.port())).await?;
    info!(address = %address, uri = %env.bind_uri, "Overlay node listening");

    let pipes = open_node_side(&env.node_to_agent, &env.agent_to_node, retry).await?;
    let mut from_agent = pipes.reader;
    let mut pipe_writer = pipes.writer;
    let (to_agent, mut agent_rx) = mpsc::unbounded_channel::<Envelope>();
    let agent_writer = tokio::spawn(async move {
        while let Some(envelope) = agent_rx.recv().await {
            if let Err(e) = write_envelope(&mut pipe_writer, &envelope).await {
                warn!(error = %e, "Writing to agent pipe failed");
                return;
            }
        }
    });

    let node = MeshNode {
        address,
        listen_uri: env.bind_uri.clone(),
        registry: PeerRegistry::new(),
        to_agent,
    };
    node.registry.learn_uri(&env.bind_uri.to_string());
    let acceptor = tokio::spawn(node.clone().accept_loop(listener));
    for uri in &env.entry_uris {
        node.dial(uri.clone());
    }

    let from_agent_loop = async {
        loop {
            match read_envelope(&mut from_agent).await {
                Ok(Some(envelope)) => node.dispatch(envelope),
                Ok(None) => {
                    info!("Agent closed its pipe");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    };

    let result = tokio::select! {
        r = from_agent_loop => r,
        _ = shutdown => {
            info!("Shutting down");
            Ok(())
        }
    };

    node.registry.broadcast(&MeshMessage::Goodbye);
    // Give link writers a moment to flush the goodbye.
    tokio::time::sleep(Duration::from_millis(50)).await;
    acceptor.abort();
    agent_writer.abort();
    result
}
