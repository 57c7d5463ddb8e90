//! The connection contract shared by every transport backend.
//!
//! A [`Connection`] moves [`Envelope`]s between the agent and one network
//! technology. All backends share the same lifecycle and protocol filtering
//! rules, implemented once in [`ConnectionState`].

use crate::envelope::{Address, Envelope};
use crate::error::{ConnectionError, ConnectionResult};
use crate::public_id::PublicId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::RwLock;

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Static identity and protocol filters of a connection, plus its status.
///
/// The status is only mutated by the owning connection's `connect`,
/// `disconnect` and end-of-stream handling.
#[derive(Debug)]
pub struct ConnectionState {
    connection_id: PublicId,
    address: Address,
    restricted_to_protocols: BTreeSet<PublicId>,
    excluded_protocols: BTreeSet<PublicId>,
    status: RwLock<ConnectionStatus>,
}

impl ConnectionState {
    /// Create a disconnected state with no protocol filters.
    pub fn new(connection_id: PublicId, address: Address) -> Self {
        Self {
            connection_id,
            address,
            restricted_to_protocols: BTreeSet::new(),
            excluded_protocols: BTreeSet::new(),
            status: RwLock::new(ConnectionStatus::Disconnected),
        }
    }

    /// Set the protocol allow-list and deny-list.
    pub fn with_filters(
        mut self,
        restricted_to_protocols: BTreeSet<PublicId>,
        excluded_protocols: BTreeSet<PublicId>,
    ) -> Self {
        self.restricted_to_protocols = restricted_to_protocols;
        self.excluded_protocols = excluded_protocols;
        self
    }

    pub fn connection_id(&self) -> &PublicId {
        &self.connection_id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn restricted_to_protocols(&self) -> &BTreeSet<PublicId> {
        &self.restricted_to_protocols
    }

    pub fn excluded_protocols(&self) -> &BTreeSet<PublicId> {
        &self.excluded_protocols
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *current != status {
            tracing::debug!(
                connection = %self.connection_id,
                from = %*current,
                to = %status,
                "Connection status changed"
            );
            *current = status;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        self.status() == ConnectionStatus::Disconnected
    }

    /// Fail with `NotConnected` unless the status is `connected`.
    pub fn ensure_connected(&self) -> ConnectionResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConnectionError::NotConnected(self.connection_id.clone()))
        }
    }

    /// Whether the filters allow `protocol` through this connection.
    pub fn supports_protocol(&self, protocol: &PublicId) -> bool {
        if self.excluded_protocols.contains(protocol) {
            return false;
        }
        self.restricted_to_protocols.is_empty() || self.restricted_to_protocols.contains(protocol)
    }

    /// Fail with `ProtocolNotSupported` if the filters reject `protocol`.
    pub fn check_protocol(&self, protocol: &PublicId) -> ConnectionResult<()> {
        if self.supports_protocol(protocol) {
            Ok(())
        } else {
            Err(ConnectionError::ProtocolNotSupported {
                protocol: protocol.clone(),
                connection: self.connection_id.clone(),
            })
        }
    }

    /// The checks every `send` performs before any side effect.
    pub fn ensure_sendable(&self, envelope: &Envelope) -> ConnectionResult<()> {
        self.ensure_connected()?;
        self.check_protocol(envelope.protocol_id())
    }
}

/// A transport backend.
///
/// Methods take `&self` so that one task can `receive` while another
/// `send`s; implementations keep their mutable parts behind locks.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The shared identity, filter and status block.
    fn state(&self) -> &ConnectionState;

    fn connection_id(&self) -> &PublicId {
        self.state().connection_id()
    }

    fn address(&self) -> &Address {
        self.state().address()
    }

    fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    /// Acquire backend resources. A no-op when already connected.
    async fn connect(&self) -> ConnectionResult<()>;

    /// Release every backend resource. A no-op when already disconnected;
    /// teardown failures are logged, not returned.
    async fn disconnect(&self) -> ConnectionResult<()>;

    /// Hand an envelope to the backend without waiting for any reply.
    async fn send(&self, envelope: Envelope) -> ConnectionResult<()>;

    /// Wait for the next inbound envelope. `None` means the connection
    /// closed. Dropping the future never loses an envelope.
    async fn receive(&self) -> ConnectionResult<Option<Envelope>>;
}
