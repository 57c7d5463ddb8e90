//! Fan-out of outbound envelopes and fan-in of inbound ones across several
//! connections.

use courier_types::{Connection, ConnectionError, Envelope, PublicId};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum MultiplexerError {
    #[error("Multiplexer needs at least one connection")]
    NoConnections,

    #[error("Connection {0} registered twice")]
    DuplicateConnection(PublicId),

    #[error("No connection registered with id {0}")]
    UnknownConnection(PublicId),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Owns a set of connections and presents them to the agent as one
/// envelope stream.
pub struct Multiplexer {
    connections: Vec<Arc<dyn Connection>>,
    default_connection: PublicId,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    shutdown_tx: watch::Sender<bool>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Multiplexer {
    /// The first connection becomes the default route.
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Result<Self, MultiplexerError> {
        let Some(first) = connections.first() else {
            return Err(MultiplexerError::NoConnections);
        };
        let default_connection = first.connection_id().clone();
        let mut seen = HashSet::new();
        for conn in &connections {
            if !seen.insert(conn.connection_id().clone()) {
                return Err(MultiplexerError::DuplicateConnection(
                    conn.connection_id().clone(),
                ));
            }
        }
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            connections,
            default_connection,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            shutdown_tx,
            pumps: Mutex::new(Vec::new()),
        })
    }

    /// Route envelopes without a routing hint to `connection_id`.
    pub fn with_default(mut self, connection_id: PublicId) -> Result<Self, MultiplexerError> {
        if self.connection(&connection_id).is_none() {
            return Err(MultiplexerError::UnknownConnection(connection_id));
        }
        self.default_connection = connection_id;
        Ok(self)
    }

    pub fn connection(&self, connection_id: &PublicId) -> Option<&Arc<dyn Connection>> {
        self.connections
            .iter()
            .find(|c| c.connection_id() == connection_id)
    }

    pub fn connections(&self) -> &[Arc<dyn Connection>] {
        &self.connections
    }

    pub fn default_connection(&self) -> &PublicId {
        &self.default_connection
    }

    pub fn is_connected(&self) -> bool {
        self.connections.iter().all(|c| c.state().is_connected())
    }

    /// Connect every connection, then start draining their inbound traffic.
    ///
    /// If one fails, the ones already connected are disconnected again and
    /// the error is returned.
    pub async fn connect_all(&self) -> Result<(), MultiplexerError> {
        let mut pumps = self.pumps.lock().await;
        if !pumps.is_empty() {
            debug!("Multiplexer already connected");
            return Ok(());
        }
        for (i, conn) in self.connections.iter().enumerate() {
            if let Err(e) = conn.connect().await {
                error!(connection = %conn.connection_id(), error = %e, "Connection failed to connect");
                for earlier in &self.connections[..i] {
                    if let Err(e) = earlier.disconnect().await {
                        warn!(connection = %earlier.connection_id(), error = %e, "Rollback disconnect failed");
                    }
                }
                return Err(e.into());
            }
        }

        self.shutdown_tx.send_replace(false);
        for conn in &self.connections {
            pumps.push(tokio::spawn(pump(
                conn.clone(),
                self.inbound_tx.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }
        info!(count = self.connections.len(), "Multiplexer connected");
        Ok(())
    }

    /// Stop the receive pumps and disconnect every connection. Failures are
    /// logged and the remaining connections are still disconnected.
    pub async fn disconnect_all(&self) {
        self.shutdown_tx.send_replace(true);
        let pumps = std::mem::take(&mut *self.pumps.lock().await);
        for task in pumps {
            if let Err(e) = task.await {
                debug!(error = %e, "Receive pump ended abnormally");
            }
        }
        for conn in &self.connections {
            if let Err(e) = conn.disconnect().await {
                warn!(connection = %conn.connection_id(), error = %e, "Disconnect failed");
            }
        }
        info!("Multiplexer disconnected");
    }

    /// Send through the connection named by the envelope's routing context,
    /// or the default connection when there is none.
    pub async fn put(&self, envelope: Envelope) -> Result<(), MultiplexerError> {
        let target = envelope
            .target_connection()
            .unwrap_or(&self.default_connection)
            .clone();
        let Some(conn) = self.connection(&target) else {
            return Err(MultiplexerError::UnknownConnection(target));
        };
        debug!(connection = %target, to = %envelope.to(), "Routing outbound envelope");
        conn.send(envelope).await?;
        Ok(())
    }

    /// Next inbound envelope from any connection. Cancel-safe.
    pub async fn get(&self) -> Option<Envelope> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Next inbound envelope if one is already queued.
    pub async fn try_get(&self) -> Option<Envelope> {
        self.inbound_rx.lock().await.try_recv().ok()
    }
}

async fn pump(
    conn: Arc<dyn Connection>,
    tx: mpsc::UnboundedSender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = conn.receive() => match received {
                Ok(Some(envelope)) => {
                    if tx.send(envelope).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    info!(connection = %conn.connection_id(), "Connection closed its inbound stream");
                    return;
                }
                Err(e) => {
                    warn!(connection = %conn.connection_id(), error = %e, "Receive failed, stopping pump");
                    return;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InboundQueue;
    use async_trait::async_trait;
    use courier_types::{
        Address, ConnectionResult, ConnectionState, ConnectionStatus, RoutingContext, SetupError,
    };
    use std::time::Duration;

    /// Records sends and replays injected envelopes.
    struct MockConnection {
        state: ConnectionState,
        inbound: InboundQueue,
        sent: std::sync::Mutex<Vec<Envelope>>,
        fail_connect: bool,
    }

    impl MockConnection {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self::build(id, false))
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self::build(id, true))
        }

        fn build(id: &str, fail_connect: bool) -> Self {
            Self {
                state: ConnectionState::new(id.parse().unwrap(), Address::from("agent")),
                inbound: InboundQueue::new(),
                sent: std::sync::Mutex::new(Vec::new()),
                fail_connect,
            }
        }

        fn inject(&self, body: &str) {
            assert!(self.inbound.push(envelope(body)));
        }

        fn sent(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn state(&self) -> &ConnectionState {
            &self.state
        }

        async fn connect(&self) -> ConnectionResult<()> {
            if self.fail_connect {
                return Err(SetupError::Bind {
                    addr: "127.0.0.1:1".into(),
                    reason: "in use".into(),
                }
                .into());
            }
            self.inbound.open().await;
            self.state.set_status(ConnectionStatus::Connected);
            Ok(())
        }

        async fn disconnect(&self) -> ConnectionResult<()> {
            self.inbound.close();
            self.state.set_status(ConnectionStatus::Disconnected);
            Ok(())
        }

        async fn send(&self, envelope: Envelope) -> ConnectionResult<()> {
            self.state.ensure_sendable(&envelope)?;
            self.sent.lock().unwrap().push(envelope);
            Ok(())
        }

        async fn receive(&self) -> ConnectionResult<Option<Envelope>> {
            self.state.ensure_connected()?;
            Ok(self.inbound.next().await)
        }
    }

    fn dynamic(list: &[&Arc<MockConnection>]) -> Vec<Arc<dyn Connection>> {
        list.iter()
            .map(|c| Arc::clone(c) as Arc<dyn Connection>)
            .collect()
    }

    fn envelope(body: &str) -> Envelope {
        Envelope::new(
            "peer",
            "agent",
            "courier/default:0.1.0".parse().unwrap(),
            body.as_bytes().to_vec(),
        )
        .unwrap()
    }

    fn routed(body: &str, connection: &str) -> Envelope {
        envelope(body).with_context(RoutingContext::for_connection(connection.parse().unwrap()))
    }

    async fn next(mux: &Multiplexer) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), mux.get())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_construction_rules() {
        assert!(matches!(
            Multiplexer::new(Vec::new()),
            Err(MultiplexerError::NoConnections)
        ));
        let a = MockConnection::new("courier/a:0.1.0");
        let again = MockConnection::new("courier/a:0.1.0");
        assert!(matches!(
            Multiplexer::new(dynamic(&[&a, &again])),
            Err(MultiplexerError::DuplicateConnection(_))
        ));
        let mux = Multiplexer::new(dynamic(&[&a])).unwrap();
        assert!(matches!(
            mux.with_default("courier/b:0.1.0".parse().unwrap()),
            Err(MultiplexerError::UnknownConnection(_))
        ));
    }

    #[tokio::test]
    async fn test_put_routes_by_context_or_default() {
        let a = MockConnection::new("courier/a:0.1.0");
        let b = MockConnection::new("courier/b:0.1.0");
        let mux = Multiplexer::new(dynamic(&[&a, &b]))
            .unwrap()
            .with_default("courier/b:0.1.0".parse().unwrap())
            .unwrap();
        mux.connect_all().await.unwrap();
        assert!(mux.is_connected());

        mux.put(envelope("plain")).await.unwrap();
        mux.put(routed("to a", "courier/a:0.1.0")).await.unwrap();
        assert!(matches!(
            mux.put(routed("nowhere", "courier/zzz:0.1.0")).await,
            Err(MultiplexerError::UnknownConnection(_))
        ));

        assert_eq!(a.sent().len(), 1);
        assert_eq!(a.sent()[0].message(), b"to a");
        assert_eq!(b.sent().len(), 1);
        assert_eq!(b.sent()[0].message(), b"plain");
        mux.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_get_merges_inbound() {
        let a = MockConnection::new("courier/a:0.1.0");
        let b = MockConnection::new("courier/b:0.1.0");
        let mux = Multiplexer::new(dynamic(&[&a, &b])).unwrap();
        mux.connect_all().await.unwrap();

        a.inject("from a");
        b.inject("from b");
        let mut bodies = vec![next(&mux).await, next(&mux).await]
            .into_iter()
            .map(|e| e.message().to_vec())
            .collect::<Vec<_>>();
        bodies.sort();
        assert_eq!(bodies, vec![b"from a".to_vec(), b"from b".to_vec()]);
        assert!(mux.try_get().await.is_none());
        mux.disconnect_all().await;
    }

    #[tokio::test]
    async fn test_connect_failure_rolls_back() {
        let a = MockConnection::new("courier/a:0.1.0");
        let broken = MockConnection::failing("courier/broken:0.1.0");
        let mux = Multiplexer::new(dynamic(&[&a, &broken])).unwrap();
        let err = mux.connect_all().await.unwrap_err();
        assert!(matches!(
            err,
            MultiplexerError::Connection(ConnectionError::Setup(SetupError::Bind { .. }))
        ));
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_all_then_reconnect() {
        let a = MockConnection::new("courier/a:0.1.0");
        let mux = Multiplexer::new(dynamic(&[&a])).unwrap();
        mux.connect_all().await.unwrap();
        mux.disconnect_all().await;
        assert_eq!(a.status(), ConnectionStatus::Disconnected);
        assert!(matches!(
            mux.put(envelope("late")).await,
            Err(MultiplexerError::Connection(ConnectionError::NotConnected(_)))
        ));

        mux.connect_all().await.unwrap();
        a.inject("again");
        assert_eq!(next(&mux).await.message(), b"again");
        mux.disconnect_all().await;
    }
}
